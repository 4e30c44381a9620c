//! Request/result state machine for one animation session.
//!
//! The studio owns what the user has entered (image, prompt, aspect ratio),
//! whether a usable key is selected, and the outcome of the last run. A run
//! hands the inputs to a [`VideoGenerator`] and mirrors its status strings
//! into `loading_status`.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::credentials::KeySelector;
use crate::veo_api::{self, AspectRatio, GeneratedVideo, InputImage, VeoClient};

pub const MSG_NO_IMAGE: &str = "Please upload an image first.";
pub const MSG_NO_PROMPT: &str = "Please describe the animation.";
pub const MSG_SELECT_FAILED: &str = "Failed to select API Key. Please try again.";
pub const MSG_UNEXPECTED: &str = "An unexpected error occurred.";
pub const STATUS_START: &str = "Initializing...";

/// Anything that can turn an image and a prompt into a video
#[async_trait]
pub trait VideoGenerator: Sync {
    async fn generate_video(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> veo_api::Result<GeneratedVideo>;
}

#[async_trait]
impl VideoGenerator for VeoClient {
    async fn generate_video(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> veo_api::Result<GeneratedVideo> {
        VeoClient::generate_video(self, image, prompt, aspect_ratio, on_status).await
    }
}

/// Which view the session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// No usable key yet; the only action is selecting one
    KeySelection,
    Editor,
}

#[derive(Debug, Default)]
pub struct Studio {
    api_key_ready: bool,
    image: Option<InputImage>,
    prompt: String,
    aspect_ratio: AspectRatio,
    is_generating: bool,
    loading_status: String,
    video: Option<GeneratedVideo>,
    error: Option<String>,
}

impl Studio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn screen(&self) -> Screen {
        if self.api_key_ready {
            Screen::Editor
        } else {
            Screen::KeySelection
        }
    }

    pub fn api_key_ready(&self) -> bool {
        self.api_key_ready
    }

    pub fn image(&self) -> Option<&InputImage> {
        self.image.as_ref()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating
    }

    pub fn loading_status(&self) -> &str {
        &self.loading_status
    }

    pub fn video(&self) -> Option<&GeneratedVideo> {
        self.video.as_ref()
    }

    pub fn take_video(&mut self) -> Option<GeneratedVideo> {
        self.video.take()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn check_api_key<S: KeySelector + ?Sized>(&mut self, selector: &S) {
        match selector.has_selected_key() {
            Ok(ready) => self.api_key_ready = ready,
            Err(e) => warn!("Error checking API key: {}", e),
        }
    }

    /// Run the selection flow. Success is taken at face value.
    pub fn select_api_key<S: KeySelector + ?Sized>(&mut self, selector: &mut S) -> bool {
        match selector.select_key() {
            Ok(()) => {
                self.api_key_ready = true;
                true
            }
            Err(e) => {
                warn!("Error selecting API key: {}", e);
                self.error = Some(MSG_SELECT_FAILED.to_string());
                false
            }
        }
    }

    pub fn set_image(&mut self, image: InputImage) {
        self.image = Some(image);
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: AspectRatio) {
        self.aspect_ratio = aspect_ratio;
    }

    /// Whether the submit action is enabled
    pub fn can_generate(&self) -> bool {
        !self.is_generating && self.image.is_some() && !self.prompt.is_empty()
    }

    /// Validate inputs, run the generator and record the outcome.
    ///
    /// Returns the new video on success; on failure the message is in
    /// [`Studio::error`]. A rejected key drops the session back to
    /// [`Screen::KeySelection`].
    pub async fn generate<G: VideoGenerator + ?Sized>(
        &mut self,
        generator: &G,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Option<&GeneratedVideo> {
        let Some(image) = self.image.clone() else {
            self.error = Some(MSG_NO_IMAGE.to_string());
            return None;
        };
        if self.prompt.trim().is_empty() {
            self.error = Some(MSG_NO_PROMPT.to_string());
            return None;
        }

        self.is_generating = true;
        self.video = None;
        self.error = None;
        self.loading_status = STATUS_START.to_string();
        on_status(STATUS_START);

        let prompt = self.prompt.clone();
        let status = &mut self.loading_status;
        let result = generator
            .generate_video(&image, &prompt, self.aspect_ratio, &mut |msg: &str| {
                *status = msg.to_string();
                on_status(msg);
            })
            .await;

        match result {
            Ok(video) => {
                info!("Animation ready ({} bytes)", video.data.len());
                self.video = Some(video);
            }
            Err(e) => {
                let message = e.to_string();
                self.error = Some(if message.is_empty() {
                    MSG_UNEXPECTED.to_string()
                } else {
                    message
                });
                if e.is_api_key_error() {
                    self.api_key_ready = false;
                }
            }
        }

        self.is_generating = false;
        self.video.as_ref()
    }
}
