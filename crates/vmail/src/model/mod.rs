//! Networks: world model (encoders, RSSM, decoders) and the dense heads.

mod actor;
mod decoder;
mod distribution;
mod encoder;
mod rssm;
mod world;

pub use actor::ActionDecoder;
pub use decoder::{ConvDecoder, DenseDecoder, OutputKind};
pub use distribution::{kl_divergence, Distribution};
pub use encoder::{ConvEncoder, DenseEncoder};
pub use rssm::{LatentState, Rssm};
pub use world::WorldModel;
