use super::decoder::{ConvDecoder, DenseDecoder, OutputKind};
use super::encoder::{ConvEncoder, DenseEncoder};
use super::rssm::Rssm;
use crate::config::VmailConfig;
use crate::{Result, VmailError};
use tch::{nn, Tensor};

/// Everything trained by the model optimizer: encoders, dynamics, image
/// decoder and the optional continuation head.
#[derive(Debug)]
pub struct WorldModel {
    pub encoder: ConvEncoder,
    pub proprio_encoder: Option<DenseEncoder>,
    pub rssm: Rssm,
    pub decoder: ConvDecoder,
    pub pcont: Option<DenseDecoder>,
}

impl WorldModel {
    /// `proprio_dim` is required when proprioceptive observations are enabled.
    pub fn new(
        p: &nn::Path,
        config: &VmailConfig,
        action_dim: i64,
        proprio_dim: Option<i64>,
    ) -> Result<Self> {
        let channels = config.image_channels();
        let encoder = ConvEncoder::new(
            &(p / "encoder"),
            channels,
            config.cnn_depth,
            config.image_size,
            config.cnn_act,
        );

        let proprio_encoder = if config.use_proprio_obs {
            let dim = proprio_dim.ok_or_else(|| {
                VmailError::Config("use_proprio_obs is set but proprio size is unknown".into())
            })?;
            Some(DenseEncoder::new(
                &(p / "proprio_encoder"),
                dim,
                config.proprio_layers,
                config.hidden_units,
                config.out_units,
                config.dense_act,
            ))
        } else {
            None
        };

        let embed_size = encoder.embed_size()
            + proprio_encoder
                .as_ref()
                .map(DenseEncoder::embed_size)
                .unwrap_or(0);
        let rssm = Rssm::new(
            &(p / "rssm"),
            config.stoch_size,
            config.deter_size,
            config.deter_size,
            action_dim,
            embed_size,
        );

        let feat_size = config.feature_size();
        let decoder = ConvDecoder::new(
            &(p / "decoder"),
            feat_size,
            config.cnn_depth,
            channels,
            config.cnn_act,
        );
        let pcont = config.pcont.then(|| {
            DenseDecoder::new(
                &(p / "pcont"),
                feat_size,
                3,
                config.num_units,
                OutputKind::Binary,
                config.dense_act,
            )
        });

        Ok(Self {
            encoder,
            proprio_encoder,
            rssm,
            decoder,
            pcont,
        })
    }

    /// Embed `[.., H, W, C]` pixels and optional `[.., P]` proprioception.
    pub fn embed(&self, image: &Tensor, proprio: Option<&Tensor>) -> Result<Tensor> {
        let embed = self.encoder.forward(image);
        match (&self.proprio_encoder, proprio) {
            (Some(encoder), Some(proprio)) => {
                Ok(Tensor::cat(&[embed, encoder.forward(proprio)], -1))
            }
            (Some(_), None) => Err(VmailError::Data(
                "proprioceptive observations missing from batch".into(),
            )),
            (None, _) => Ok(embed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_embed_concatenates_proprio() {
        let config = VmailConfig::small();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WorldModel::new(&vs.root(), &config, 2, Some(4)).unwrap();
        let image = Tensor::zeros([2, 3, 64, 64, 3], (Kind::Float, Device::Cpu));
        let proprio = Tensor::zeros([2, 3, 4], (Kind::Float, Device::Cpu));
        let embed = model.embed(&image, Some(&proprio)).unwrap();
        assert_eq!(
            embed.size(),
            vec![2, 3, model.encoder.embed_size() + config.out_units]
        );
        assert!(model.embed(&image, None).is_err());
    }

    #[test]
    fn test_proprio_size_is_required() {
        let config = VmailConfig::small();
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(WorldModel::new(&vs.root(), &config, 2, None).is_err());
    }
}
