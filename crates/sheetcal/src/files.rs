//! Image files on disk: loading, saving and directory-backed capture I/O.

use image::{DynamicImage, GrayImage, RgbImage};
use log::{debug, warn};
use sheetcal_capture::{CameraId, FrameSink, FrameSource, FrameStamp, SinkError, SourceError};
use sheetcal_core::{Frame, FrameError};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// File name of the most recent raw capture.
pub const LATEST_FRAME: &str = "latest_frame.png";
/// File name of the most recent rectified capture, inside [`RECTIFIED_DIR`].
pub const LATEST_RECTIFIED: &str = "latest_rectified.png";
pub const RECTIFIED_DIR: &str = "rectified";

const STILL_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Convert a decoded image: color images become 3-channel RGB frames,
/// everything else single-channel gray.
pub fn frame_from_dynamic(img: &DynamicImage) -> Frame {
    if img.color().has_color() {
        let rgb = img.to_rgb8();
        Frame {
            width: rgb.width() as usize,
            height: rgb.height() as usize,
            channels: 3,
            data: rgb.into_raw(),
        }
    } else {
        let gray = img.to_luma8();
        Frame {
            width: gray.width() as usize,
            height: gray.height() as usize,
            channels: 1,
            data: gray.into_raw(),
        }
    }
}

pub fn frame_to_dynamic(frame: &Frame) -> Result<DynamicImage, FileError> {
    let (w, h) = (frame.width as u32, frame.height as u32);
    let invalid = || FrameError::InvalidBuffer {
        expected: frame.width * frame.height * frame.channels,
        got: frame.data.len(),
    };
    match frame.channels {
        1 => GrayImage::from_raw(w, h, frame.data.clone())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| invalid().into()),
        3 => RgbImage::from_raw(w, h, frame.data.clone())
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| invalid().into()),
        n => Err(FrameError::UnsupportedChannels(n).into()),
    }
}

#[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
pub fn load_frame(path: impl AsRef<Path>) -> Result<Frame, FileError> {
    let img = image::open(path.as_ref())?;
    Ok(frame_from_dynamic(&img))
}

/// Save `frame`; the format follows the file extension.
pub fn save_frame(frame: &Frame, path: impl AsRef<Path>) -> Result<(), FileError> {
    frame_to_dynamic(frame)?.save(path.as_ref())?;
    Ok(())
}

/// Still images in `dir`, sorted by file name.
pub fn list_stills(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, FileError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_still = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| STILL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && is_still {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Replays the stills of a directory in name order, then reports
/// [`SourceError::Exhausted`].
#[derive(Clone, Debug)]
pub struct DirectorySource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FileError> {
        let paths = list_stills(dir)?;
        debug!("directory source with {} stills", paths.len());
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths, next: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.paths.len() - self.next
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Err(SourceError::Exhausted);
        };
        self.next += 1;
        load_frame(path).map_err(|err| match err {
            FileError::Io(io) => SourceError::Io(io),
            other => SourceError::Decode {
                detail: format!("{}: {other}", path.display()),
            },
        })
    }
}

/// Writes captures as PNG files:
///
/// - `{root}/{camera}_{unix_ms}_{sequence}.png` and `{root}/latest_frame.png`
/// - `{root}/rectified/{camera}_{unix_ms}_{sequence}_rectified.png` and
///   `{root}/rectified/latest_rectified.png`
#[derive(Clone, Debug)]
pub struct DirectorySink {
    root: PathBuf,
    camera: CameraId,
}

impl DirectorySink {
    /// Create the output directories if needed.
    pub fn create(root: impl Into<PathBuf>, camera: CameraId) -> Result<Self, FileError> {
        let root = root.into();
        fs::create_dir_all(root.join(RECTIFIED_DIR))?;
        Ok(Self { root, camera })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_path(&self, stamp: &FrameStamp) -> PathBuf {
        self.root.join(format!(
            "{}_{}_{:06}.png",
            self.camera, stamp.unix_ms, stamp.sequence
        ))
    }

    pub fn rectified_path(&self, stamp: &FrameStamp) -> PathBuf {
        self.root.join(RECTIFIED_DIR).join(format!(
            "{}_{}_{:06}_rectified.png",
            self.camera, stamp.unix_ms, stamp.sequence
        ))
    }

    fn write(frame: &Frame, path: &Path, latest: &Path) -> Result<(), SinkError> {
        save_frame(frame, path).map_err(|err| match err {
            FileError::Io(io) => SinkError::Io(io),
            other => SinkError::Encode {
                detail: format!("{}: {other}", path.display()),
            },
        })?;
        if let Err(err) = fs::copy(path, latest) {
            warn!("updating {} failed: {err}", latest.display());
        }
        Ok(())
    }
}

impl FrameSink for DirectorySink {
    fn save_raw(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        let path = self.raw_path(stamp);
        Self::write(frame, &path, &self.root.join(LATEST_FRAME))
    }

    fn save_rectified(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        let path = self.rectified_path(stamp);
        let latest = self.root.join(RECTIFIED_DIR).join(LATEST_RECTIFIED);
        Self::write(frame, &path, &latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcal_capture::Side;

    #[test]
    fn gray_and_rgb_survive_png() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut gray = Frame::filled(7, 5, 1, 30);
        gray.pixel_mut(3, 2)[0] = 200;
        let path = dir.path().join("gray.png");
        save_frame(&gray, &path).expect("save");
        assert_eq!(load_frame(&path).expect("load"), gray);

        let mut rgb = Frame::filled(4, 3, 3, 0);
        rgb.pixel_mut(1, 1).copy_from_slice(&[10, 20, 30]);
        let path = dir.path().join("rgb.png");
        save_frame(&rgb, &path).expect("save");
        assert_eq!(load_frame(&path).expect("load"), rgb);
    }

    #[test]
    fn source_replays_in_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, value) in [("b.png", 2u8), ("a.png", 1), ("c.png", 3)] {
            save_frame(&Frame::filled(2, 2, 1, value), dir.path().join(name)).expect("save");
        }
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let mut source = DirectorySource::open(dir.path()).expect("open");
        assert_eq!(source.remaining(), 3);
        let values: Vec<u8> = (0..3)
            .map(|_| source.next_frame().expect("frame").data[0])
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(matches!(source.next_frame(), Err(SourceError::Exhausted)));
    }

    #[test]
    fn corrupt_still_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.png"), b"not a png").expect("write");
        let mut source = DirectorySource::open(dir.path()).expect("open");
        assert!(matches!(
            source.next_frame(),
            Err(SourceError::Decode { .. })
        ));
    }

    #[test]
    fn sink_names_files_and_latest_aliases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            DirectorySink::create(dir.path(), CameraId::new(3, Side::Odd)).expect("sink");
        let stamp = FrameStamp {
            sequence: 7,
            unix_ms: 1_700_000_000_123,
        };
        sink.save_raw(&stamp, &Frame::filled(4, 4, 3, 9)).expect("raw");
        sink.save_rectified(&stamp, &Frame::filled(2, 2, 3, 9)).expect("rectified");

        let raw = dir.path().join("sheet3_odd_1700000000123_000007.png");
        let rect = dir
            .path()
            .join("rectified")
            .join("sheet3_odd_1700000000123_000007_rectified.png");
        assert_eq!(sink.raw_path(&stamp), raw);
        assert!(raw.is_file());
        assert!(rect.is_file());
        assert!(dir.path().join(LATEST_FRAME).is_file());
        assert_eq!(
            load_frame(dir.path().join("rectified").join(LATEST_RECTIFIED))
                .expect("latest")
                .width,
            2
        );
    }
}
