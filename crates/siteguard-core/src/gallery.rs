//! Known-person gallery, loaded once from `dir/<identity>/<image>`.

use crate::frame::Frame;
use crate::inference::FaceEncoder;
use crate::types::GalleryEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery directory not readable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only set of reference encodings.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Encode every image under `dir/<identity>/`.
    ///
    /// Stray files at the top level and undecodable images are skipped with
    /// a warning. Images without a detectable face contribute nothing, so an
    /// identity whose images all fail is absent from the result.
    pub fn load(dir: &Path, encoder: &mut impl FaceEncoder) -> Result<Self, GalleryError> {
        let unreadable = |source| GalleryError::Unreadable {
            path: dir.to_path_buf(),
            source,
        };

        let mut identities: Vec<(String, PathBuf)> = std::fs::read_dir(dir)
            .map_err(unreadable)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if !path.is_dir() {
                    tracing::debug!(path = %path.display(), "skipping non-directory gallery entry");
                    return None;
                }
                let name = path.file_name()?.to_str()?.to_string();
                Some((name, path))
            })
            .collect();
        identities.sort();

        let mut entries = Vec::new();
        for (identity, path) in identities {
            let before = entries.len();
            for image_path in image_files(&path) {
                let image = match image::open(&image_path) {
                    Ok(img) => img.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(path = %image_path.display(), error = %e, "skipping unreadable gallery image");
                        continue;
                    }
                };
                let frame = Frame::new(image, 0);
                match encoder.encode_best(&frame) {
                    Ok(Some(embedding)) => entries.push(GalleryEntry {
                        identity: identity.clone(),
                        source: image_path,
                        embedding,
                    }),
                    Ok(None) => {
                        tracing::warn!(path = %image_path.display(), "no face found in gallery image")
                    }
                    Err(e) => {
                        tracing::warn!(path = %image_path.display(), error = %e, "failed to encode gallery image")
                    }
                }
            }
            tracing::debug!(identity = %identity, encodings = entries.len() - before, "gallery identity loaded");
        }

        let gallery = Self { entries };
        tracing::info!(
            dir = %dir.display(),
            identities = gallery.identities().len(),
            encodings = gallery.len(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct identity names, sorted.
    pub fn identities(&self) -> Vec<String> {
        self.encoding_counts().into_keys().collect()
    }

    /// Number of reference encodings per identity.
    pub fn encoding_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.identity.clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn image_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(dir) else {
        tracing::warn!(path = %dir.display(), "identity directory not readable");
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use crate::types::Embedding;
    use image::{Rgb, RgbImage};

    /// Treats a dark image as "no face"; otherwise encodes the red channel.
    struct FakeEncoder;

    impl FaceEncoder for FakeEncoder {
        fn encode_best(&mut self, frame: &Frame) -> Result<Option<Embedding>, InferenceError> {
            let px = frame.image().get_pixel(0, 0);
            if px[0] == 0 {
                return Ok(None);
            }
            Ok(Some(Embedding {
                values: vec![px[0] as f32, 1.0],
                model_version: None,
            }))
        }
    }

    fn write_png(path: &Path, red: u8) {
        RgbImage::from_pixel(4, 4, Rgb([red, 10, 10])).save(path).unwrap();
    }

    #[test]
    fn test_load_directory_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bob")).unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        write_png(&dir.path().join("alice/1.png"), 50);
        write_png(&dir.path().join("alice/2.png"), 60);
        write_png(&dir.path().join("bob/1.png"), 70);

        let gallery = Gallery::load(dir.path(), &mut FakeEncoder).unwrap();
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.identities(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(gallery.encoding_counts()["alice"], 2);
    }

    #[test]
    fn test_load_skips_stray_files_and_faceless_identities() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), "not an identity").unwrap();
        std::fs::create_dir(dir.path().join("carol")).unwrap();
        write_png(&dir.path().join("carol/dark.png"), 0);
        std::fs::create_dir(dir.path().join("dave")).unwrap();
        std::fs::write(dir.path().join("dave/broken.jpg"), b"not an image").unwrap();
        write_png(&dir.path().join("dave/ok.png"), 90);

        let gallery = Gallery::load(dir.path(), &mut FakeEncoder).unwrap();
        assert_eq!(gallery.identities(), vec!["dave".to_string()]);
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_load_missing_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Gallery::load(&missing, &mut FakeEncoder),
            Err(GalleryError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_empty_gallery() {
        let gallery = Gallery::empty();
        assert!(gallery.is_empty());
        assert!(gallery.identities().is_empty());
    }
}
