pub mod credentials;
pub mod studio;
pub mod veo_api;

pub use credentials::{ApiKeyStore, CredentialError, KeySelector, PromptSelector};
pub use studio::{Screen, Studio, VideoGenerator};
pub use veo_api::{
    AspectRatio, GeneratedVideo, InputImage, Resolution, VeoClient, VeoClientConfig, VeoError,
    VeoModel,
};
