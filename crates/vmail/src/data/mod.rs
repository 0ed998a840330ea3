//! Episode storage and replay sampling.

mod dataset;
mod episode;

pub use dataset::{collate, observation_batch, preprocess_image, Batch, EpisodeDataset};
pub use episode::{
    copy_episodes, count_episodes, count_steps, episode_length, list_episodes, Episode, Transition,
};
