//! Named binary-asset transforms.
//!
//! A transform sees exactly two things: a way to open reference archive
//! members and the working tree root it writes into.

use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use crate::archive::MemberSource;
use crate::{join_relative, BuildError, Result};

pub trait Transform: Send + Sync {
    fn apply(&self, archive: &dyn MemberSource, build_dir: &Path) -> Result<()>;
}

/// Writes a horizontally mirrored copy of an archive image.
#[derive(Debug, Clone)]
pub struct FlipAsset {
    pub source: String,
    pub output: String,
    /// Also delete any copy of `source` from the build tree.
    pub remove_source: bool,
}

impl FlipAsset {
    pub fn new(source: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            remove_source: false,
        }
    }

    pub fn removing_source(mut self) -> Self {
        self.remove_source = true;
        self
    }
}

impl Transform for FlipAsset {
    fn apply(&self, archive: &dyn MemberSource, build_dir: &Path) -> Result<()> {
        let image = load_image(archive, &self.source)?;
        save_image(&image.fliph(), build_dir, &self.output)?;

        if self.remove_source && self.source != self.output {
            let stale = join_relative(build_dir, &self.source)?;
            if stale.is_file() {
                debug!("Removing {}", stale.display());
                fs::remove_file(&stale).map_err(|e| BuildError::io(&stale, e))?;
            }
        }
        Ok(())
    }
}

/// Replaces an archive image with a fully transparent one of the same
/// dimensions and color type.
#[derive(Debug, Clone)]
pub struct BlankAsset {
    pub source: String,
    pub output: String,
}

impl BlankAsset {
    pub fn new(source: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
        }
    }

    /// Blank the member in place.
    pub fn in_place(member: impl Into<String>) -> Self {
        let member = member.into();
        Self::new(member.clone(), member)
    }
}

impl Transform for BlankAsset {
    fn apply(&self, archive: &dyn MemberSource, build_dir: &Path) -> Result<()> {
        let image = load_image(archive, &self.source)?;
        save_image(&blank_like(&image), build_dir, &self.output)
    }
}

/// Zeroed buffer of the same shape; zero alpha is fully transparent.
fn blank_like(image: &DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    match image {
        DynamicImage::ImageLuma8(_) => DynamicImage::new_luma8(w, h),
        DynamicImage::ImageLumaA8(_) => DynamicImage::new_luma_a8(w, h),
        DynamicImage::ImageRgb8(_) => DynamicImage::new_rgb8(w, h),
        DynamicImage::ImageLuma16(_) => DynamicImage::new_luma16(w, h),
        DynamicImage::ImageLumaA16(_) => DynamicImage::new_luma_a16(w, h),
        DynamicImage::ImageRgb16(_) => DynamicImage::new_rgb16(w, h),
        DynamicImage::ImageRgba16(_) => DynamicImage::new_rgba16(w, h),
        DynamicImage::ImageRgb32F(_) => DynamicImage::new_rgb32f(w, h),
        DynamicImage::ImageRgba32F(_) => DynamicImage::new_rgba32f(w, h),
        _ => DynamicImage::new_rgba8(w, h),
    }
}

fn load_image(archive: &dyn MemberSource, member: &str) -> Result<DynamicImage> {
    let mut reader = archive.open(member)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| BuildError::io(member, e))?;
    image::load_from_memory(&bytes).map_err(|e| BuildError::Image {
        member: member.to_string(),
        source: e,
    })
}

fn save_image(image: &DynamicImage, build_dir: &Path, output: &str) -> Result<()> {
    let dest = join_relative(build_dir, output)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    image.save(&dest).map_err(|e| BuildError::Image {
        member: output.to_string(),
        source: e,
    })
}

#[derive(Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Box<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transforms the stock option catalog refers to.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            "HUDHeads",
            FlipAsset::new("gfx/head_right.png", "gfx/head_left.png").removing_source(),
        );
        registry.register("NoHUDScarabs", BlankAsset::in_place("gfx/scarab.png"));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform + 'static) {
        self.transforms.insert(name.into(), Box::new(transform));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn run(&self, name: &str, archive: &dyn MemberSource, build_dir: &Path) -> Result<()> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| BuildError::UnknownTransform {
                name: name.to_string(),
            })?;
        debug!("Applying transform {}...", name);
        transform.apply(archive, build_dir)
    }
}
