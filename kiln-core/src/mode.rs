//! Mode selection: which pipeline serves a request is decided only by which of the
//! optional images it carries.

use image::{imageops::FilterType, DynamicImage};

use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::TextToImage, Mode::ImageToImage, Mode::Inpaint];

    pub(crate) fn index(self) -> usize {
        match self {
            Mode::TextToImage => 0,
            Mode::ImageToImage => 1,
            Mode::Inpaint => 2,
        }
    }
}

/// Mode-specific arguments handed to the generative backend.
#[derive(Debug, Clone)]
pub enum ModeParams {
    TextToImage {
        width: usize,
        height: usize,
    },
    ImageToImage {
        image: DynamicImage,
        strength: f64,
    },
    /// `mask` has the same dimensions as `image`; white marks the region to repaint.
    Inpaint {
        image: DynamicImage,
        mask: DynamicImage,
        strength: f64,
    },
}

impl ModeParams {
    pub fn mode(&self) -> Mode {
        match self {
            ModeParams::TextToImage { .. } => Mode::TextToImage,
            ModeParams::ImageToImage { .. } => Mode::ImageToImage,
            ModeParams::Inpaint { .. } => Mode::Inpaint,
        }
    }
}

/// The inputs mode selection looks at.
#[derive(Debug, Clone, Copy)]
pub struct ModeInputs<'a> {
    pub seed_image: Option<&'a DynamicImage>,
    pub mask_image: Option<&'a DynamicImage>,
    pub width: usize,
    pub height: usize,
    pub strength: f64,
}

pub fn select(inputs: ModeInputs<'_>) -> Result<ModeParams> {
    match (inputs.seed_image, inputs.mask_image) {
        (Some(image), Some(mask)) => {
            let mask = mask.resize_exact(image.width(), image.height(), FilterType::Nearest);
            Ok(ModeParams::Inpaint {
                image: image.clone(),
                mask,
                strength: inputs.strength,
            })
        }
        (None, Some(_)) => Err(GenerationError::InvalidCombination),
        (Some(image), None) => Ok(ModeParams::ImageToImage {
            image: image.clone(),
            strength: inputs.strength,
        }),
        (None, None) => Ok(ModeParams::TextToImage {
            width: inputs.width,
            height: inputs.height,
        }),
    }
}
