//! Dataset interface and batch assembly.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// One training example.
pub struct Sample {
    /// Normalized image, `[3, H, W]`.
    pub image: Tensor,
    /// Binary object mask in `[0, 1]`, `[1, H, W]`.
    pub mask: Tensor,
    /// Source path of the image, kept for reporting.
    pub path: String,
}

/// Samples stacked along a fresh leading batch axis.
pub struct Batch {
    /// `[B, 3, H, W]`
    pub images: Tensor,
    /// `[B, 1, H, W]`
    pub masks: Tensor,
    pub paths: Vec<String>,
}

/// Trait for indexable mask datasets.
///
/// Datasets return unbatched samples; [`collate`] stacks them. Loading and
/// augmentation live behind implementations of this trait, outside the core.
///
/// # Example
///
/// ```ignore
/// struct FolderDataset { entries: Vec<(PathBuf, PathBuf)>, img_size: usize }
///
/// impl Dataset for FolderDataset {
///     fn len(&self) -> usize {
///         self.entries.len()
///     }
///     fn get(&self, idx: usize, device: &Device) -> Result<Sample> {
///         let (image_path, mask_path) = &self.entries[idx];
///         let image = decode_image(image_path, self.img_size, device)?;
///         let mask = decode_mask(mask_path, self.img_size, device)?;
///         Ok(Sample { image, mask, path: image_path.display().to_string() })
///     }
/// }
/// ```
pub trait Dataset: Send + Sync {
    /// Number of samples in the dataset.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a single sample by index.
    fn get(&self, idx: usize, device: &Device) -> Result<Sample>;
}

/// Stacks samples into one batch, preserving order.
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::DataError {
            reason: "cannot collate an empty batch".to_string(),
        });
    }

    let mut images = Vec::with_capacity(samples.len());
    let mut masks = Vec::with_capacity(samples.len());
    let mut paths = Vec::with_capacity(samples.len());
    for sample in samples {
        images.push(sample.image.unsqueeze(0)?);
        masks.push(sample.mask.unsqueeze(0)?);
        paths.push(sample.path.clone());
    }

    Ok(Batch {
        images: Tensor::cat(&images, 0)?,
        masks: Tensor::cat(&masks, 0)?,
        paths,
    })
}
