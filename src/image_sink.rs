// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use canonical_error::{internal_error, CanonicalError};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use log::info;
use tiff::encoder::{colortype, compression::Deflate, TiffEncoder};

use crate::camera::Frame;
use crate::node::BusNode;

/// Persists archival captures and registers them with the host's fread
/// cache. Filenames are `<keyword>_<epoch seconds>.tiff` with a
/// monotonically unique stamp, so the archive sorts in capture order.
pub struct ImageSink {
    node: Arc<dyn BusNode>,
    out_dir: PathBuf,
    keyword: String,
    last_stamp: Mutex<i64>,
}

impl ImageSink {
    pub fn new(node: Arc<dyn BusNode>, out_dir: PathBuf, keyword: String) -> Self {
        ImageSink {
            node,
            out_dir,
            keyword,
            last_stamp: Mutex::new(0),
        }
    }

    /// Encodes `frame` as a compressed TIFF and writes it out. The file is
    /// fully written and closed before the fread cache learns about it; the
    /// cache takes ownership (`consume`) of every registered file.
    pub fn save_archival(&self, frame: &Frame) -> Result<PathBuf, CanonicalError> {
        let encoded = encode_tiff(frame)?;
        let path = self.next_archive_path();
        {
            let mut file = fs::File::create(&path).map_err(|e| {
                internal_error(format!("cannot create {}: {}", path.display(), e).as_str())
            })?;
            file.write_all(&encoded).map_err(|e| {
                internal_error(format!("cannot write {}: {}", path.display(), e).as_str())
            })?;
        }
        info!("saved new capture {}", path.display());
        self.node.fread_cache_add(&path, /*consume=*/ true)?;
        Ok(path)
    }

    fn next_archive_path(&self) -> PathBuf {
        let mut last_stamp = self.last_stamp.lock().unwrap();
        let stamp = Utc::now().timestamp().max(*last_stamp + 1);
        *last_stamp = stamp;
        self.out_dir
            .join(format!("{}_{}.tiff", self.keyword, stamp))
    }
}

/// Deflate-compressed TIFF encoding of a frame.
pub fn encode_tiff(frame: &Frame) -> Result<Vec<u8>, CanonicalError> {
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut buf)
        .map_err(|e| internal_error(format!("TIFF encode error: {}", e).as_str()))?;
    match frame {
        Frame::Gray(img) => encoder.write_image_with_compression::<colortype::Gray8, _>(
            img.width(),
            img.height(),
            Deflate::default(),
            img.as_raw(),
        ),
        Frame::Rgb(img) => encoder.write_image_with_compression::<colortype::RGB8, _>(
            img.width(),
            img.height(),
            Deflate::default(),
            img.as_raw(),
        ),
    }
    .map_err(|e| internal_error(format!("TIFF encode error: {}", e).as_str()))?;
    Ok(buf.into_inner())
}

/// JPEG preview of a frame: half resolution in both dimensions, RGB.
pub fn encode_preview_jpeg(frame: &Frame) -> Result<Vec<u8>, CanonicalError> {
    let (width, height) = frame.dimensions();
    let rgb = frame.to_rgb();
    let preview = imageops::resize(
        &rgb,
        (width / 2).max(1),
        (height / 2).max(1),
        FilterType::Triangle,
    );

    let mut jpg_buf = Vec::<u8>::new();
    jpg_buf.reserve((width * height / 4) as usize);
    let mut buffer = Cursor::new(&mut jpg_buf);
    // 90: 20x compression, mild artifacts; fine for a preview readout.
    let mut jpeg_encoder = JpegEncoder::new_with_quality(&mut buffer, /*jpeg_quality=*/ 90);
    jpeg_encoder
        .encode_image(&preview)
        .map_err(|e| internal_error(format!("JPEG encode error: {}", e).as_str()))?;
    Ok(jpg_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::path::Path;

    // Node stand-in that records what the cache was handed, and whether the
    // file was complete at registration time.
    struct RecordingNode {
        adds: Mutex<Vec<(PathBuf, bool, u64)>>,
    }

    impl RecordingNode {
        fn new() -> Self {
            RecordingNode {
                adds: Mutex::new(Vec::new()),
            }
        }
    }

    impl BusNode for RecordingNode {
        fn send_tpdo(&self, _tpdo: u16) -> Result<(), CanonicalError> {
            Ok(())
        }

        fn fread_cache_add(&self, path: &Path, consume: bool) -> Result<(), CanonicalError> {
            let size = fs::metadata(path).unwrap().len();
            self.adds
                .lock()
                .unwrap()
                .push((path.to_path_buf(), consume, size));
            Ok(())
        }
    }

    fn test_frame() -> Frame {
        Frame::Gray(GrayImage::from_pixel(16, 12, image::Luma([42u8])))
    }

    #[test]
    fn test_archival_names_are_time_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNode::new());
        let sink = ImageSink::new(node, dir.path().to_path_buf(), "img".to_string());

        // Rapid saves land in the same wall-clock second; stamps must still
        // be unique and increasing.
        let first = sink.save_archival(&test_frame()).unwrap();
        let second = sink.save_archival(&test_frame()).unwrap();
        let third = sink.save_archival(&test_frame()).unwrap();
        assert!(first < second);
        assert!(second < third);
        for path in [&first, &second, &third] {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("img_"));
            assert!(name.ends_with(".tiff"));
        }
    }

    #[test]
    fn test_cache_sees_complete_files_with_consume() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNode::new());
        let sink = ImageSink::new(
            node.clone(),
            dir.path().to_path_buf(),
            "img".to_string(),
        );

        let path = sink.save_archival(&test_frame()).unwrap();
        let adds = node.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        let (registered, consume, size_at_add) = &adds[0];
        assert_eq!(registered, &path);
        assert!(consume);
        // The registered size matches the final on-disk size; nothing was
        // appended after registration.
        assert_eq!(*size_at_add, fs::metadata(&path).unwrap().len());
        assert!(*size_at_add > 0);
    }

    #[test]
    fn test_archived_tiff_is_decodable() {
        let encoded = encode_tiff(&test_frame()).unwrap();
        let mut decoder =
            tiff::decoder::Decoder::new(Cursor::new(&encoded)).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (16, 12));
    }

    #[test]
    fn test_preview_is_half_resolution_rgb() {
        let jpeg = encode_preview_jpeg(&test_frame()).unwrap();
        assert!(!jpeg.is_empty());
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 6);
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }
}  // mod tests.
