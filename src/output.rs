//! Run directory layout, annotated image writes, and the promising-match log.

use crate::oracle::DetectedFace;
use crc32fast::Hasher as Crc32;
use image::{DynamicImage, Rgb, RgbImage};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const RUN_DIR: &str = "output";
const PROMISING_DIR: &str = "promising";
const MATCH_LOG: &str = "promising_faces.txt";
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const MAX_FILE_NAME: usize = 200;

/// Failure while persisting results.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Filesystem failure.
    #[error("output io error at {}: {source}", path.display())]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The image encoder failed.
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        /// Path being written.
        path: PathBuf,
        /// Encoder failure.
        source: image::ImageError,
    },
}

/// A scored image above the promising threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    /// Highest face similarity in the image.
    pub score: f32,
    /// Image URL.
    pub image_url: String,
    /// Page that first referenced the image.
    pub page_url: String,
}

impl fmt::Display for MatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {} {}", self.score, self.image_url, self.page_url)
    }
}

/// Where one run writes its results.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    promising: PathBuf,
}

impl OutputLayout {
    /// Creates a fresh run directory under `parent`: `output`, or the first free
    /// `output_N` when it already exists.
    pub fn create_run_dir(parent: &Path) -> Result<Self, OutputError> {
        let mut root = parent.join(RUN_DIR);
        let mut suffix = 1;
        while root.exists() {
            root = parent.join(format!("{RUN_DIR}_{suffix}"));
            suffix += 1;
        }
        Self::at(root)
    }

    /// Uses `root` as the run directory, creating it and its `promising` child.
    pub fn at(root: PathBuf) -> Result<Self, OutputError> {
        let promising = root.join(PROMISING_DIR);
        fs::create_dir_all(&promising).map_err(|source| OutputError::Io {
            path: promising.clone(),
            source,
        })?;
        Ok(Self { root, promising })
    }

    /// Run directory; receives every annotated image in save-all mode.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for promising images.
    pub fn promising_dir(&self) -> &Path {
        &self.promising
    }

    /// Append-only match log.
    pub fn match_log(&self) -> PathBuf {
        self.promising.join(MATCH_LOG)
    }

    /// Writes `image` into the run directory.
    pub fn save_scored(&self, image_url: &str, image: &RgbImage) -> Result<PathBuf, OutputError> {
        save_image(&self.root, image_url, image)
    }

    /// Writes `image` into the promising directory.
    pub fn save_promising(
        &self,
        image_url: &str,
        image: &RgbImage,
    ) -> Result<PathBuf, OutputError> {
        save_image(&self.promising, image_url, image)
    }

    /// Appends one line to the match log.
    pub fn append_match(&self, record: &MatchRecord) -> Result<(), OutputError> {
        let path = self.match_log();
        let io_err = |source| OutputError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        writeln!(file, "{record}").map_err(io_err)
    }
}

fn save_image(dir: &Path, image_url: &str, image: &RgbImage) -> Result<PathBuf, OutputError> {
    let path = dir.join(image_file_name(image_url));
    image.save(&path).map_err(|source| OutputError::Encode {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Flattens an image URL into a file name: host and path with `/` replaced by `.`.
///
/// The extension is lower-cased so the encoder can infer the format. URLs with a
/// query string, or whose name would exceed `MAX_FILE_NAME` bytes, get a CRC32 tag
/// of the full URL before the extension and a truncated stem.
pub fn image_file_name(image_url: &str) -> String {
    let (flat, has_query) = match Url::parse(image_url) {
        Ok(url) => (
            format!("{}{}", url.host_str().unwrap_or_default(), url.path()),
            url.query().is_some(),
        ),
        Err(_) => (image_url.to_string(), false),
    };
    let flat = flat.replace('/', ".");
    let (stem, ext) = match flat.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
        None => (flat.as_str(), String::new()),
    };

    if !has_query && flat.len() <= MAX_FILE_NAME {
        return join_extension(stem, &ext);
    }

    let mut hasher = Crc32::new();
    hasher.update(image_url.as_bytes());
    let tag = format!("{:08x}", hasher.finalize());
    let mut keep = MAX_FILE_NAME
        .saturating_sub(tag.len() + ext.len() + 2)
        .min(stem.len());
    while !stem.is_char_boundary(keep) {
        keep -= 1;
    }
    join_extension(&format!("{}-{tag}", &stem[..keep]), &ext)
}

fn join_extension(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// Draws a green rectangle around every face, clamped to the image bounds.
pub fn annotate(image: &DynamicImage, faces: &[DetectedFace]) -> RgbImage {
    let mut canvas = image.to_rgb8();
    for face in faces {
        draw_box(&mut canvas, face);
    }
    canvas
}

fn draw_box(canvas: &mut RgbImage, face: &DetectedFace) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp = |value: f32, max: u32| value.max(0.0).min((max - 1) as f32) as u32;
    let x1 = clamp(face.bbox.x1.min(face.bbox.x2), width);
    let x2 = clamp(face.bbox.x1.max(face.bbox.x2), width);
    let y1 = clamp(face.bbox.y1.min(face.bbox.y2), height);
    let y2 = clamp(face.bbox.y1.max(face.bbox.y2), height);

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            put(canvas, x, y1 + t);
            put(canvas, x, y2.saturating_sub(t));
        }
        for y in y1..=y2 {
            put(canvas, x1 + t, y);
            put(canvas, x2.saturating_sub(t), y);
        }
    }
}

fn put(canvas: &mut RgbImage, x: u32, y: u32) {
    if x < canvas.width() && y < canvas.height() {
        canvas.put_pixel(x, y, BOX_COLOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::BoundingBox;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x1, y1, x2, y2 },
            embedding: vec![1.0],
        }
    }

    #[test]
    fn match_record_line_format() {
        let record = MatchRecord {
            score: 0.4249,
            image_url: "https://example.com/a.jpg".into(),
            page_url: "https://example.com/".into(),
        };
        assert_eq!(
            record.to_string(),
            "0.42 https://example.com/a.jpg https://example.com/"
        );
    }

    #[test]
    fn file_names_flatten_urls() {
        assert_eq!(
            image_file_name("https://example.com/img/team/Face.JPG"),
            "example.com.img.team.Face.jpg"
        );
        assert_eq!(image_file_name("https://cdn.example.net/a.png"), "cdn.example.net.a.png");
    }

    #[test]
    fn query_strings_keep_names_distinct() {
        let small = image_file_name("https://example.com/a.jpg?w=1");
        let large = image_file_name("https://example.com/a.jpg?w=2");
        assert_ne!(small, large);
        assert_ne!(small, image_file_name("https://example.com/a.jpg"));
        for name in [&small, &large] {
            assert!(name.starts_with("example.com.a-"), "{name}");
            assert!(name.ends_with(".jpg"), "{name}");
        }
    }

    #[test]
    fn long_names_are_capped() {
        let url = format!("https://example.com/{}/ok.PNG", "a".repeat(300));
        let name = image_file_name(&url);
        assert!(name.len() <= MAX_FILE_NAME, "{} bytes", name.len());
        assert!(name.starts_with("example.com.aaa"));
        assert!(name.ends_with(".png"));
        let longer = format!("https://example.com/{}/ok.png", "a".repeat(301));
        assert_ne!(name, image_file_name(&longer));

        let parent = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::at(parent.path().join("run")).expect("layout");
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let path = layout.save_promising(&url, &image).expect("save long name");
        assert!(path.is_file());
    }

    #[test]
    fn run_dirs_do_not_collide() {
        let parent = tempfile::tempdir().expect("tempdir");
        let first = OutputLayout::create_run_dir(parent.path()).expect("first");
        let second = OutputLayout::create_run_dir(parent.path()).expect("second");
        let third = OutputLayout::create_run_dir(parent.path()).expect("third");
        assert_eq!(first.root(), parent.path().join("output"));
        assert_eq!(second.root(), parent.path().join("output_1"));
        assert_eq!(third.root(), parent.path().join("output_2"));
        assert!(first.promising_dir().is_dir());
    }

    #[test]
    fn match_log_appends() {
        let parent = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::at(parent.path().join("run")).expect("layout");
        for score in [0.5, 0.75] {
            layout
                .append_match(&MatchRecord {
                    score,
                    image_url: "i".into(),
                    page_url: "p".into(),
                })
                .expect("append");
        }
        let log = fs::read_to_string(layout.match_log()).expect("read log");
        assert_eq!(log, "0.50 i p\n0.75 i p\n");
    }

    #[test]
    fn annotation_draws_clamped_boxes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([0, 0, 0])));
        let canvas = annotate(&image, &[face(2.0, 3.0, 10.0, 12.0), face(-5.0, 15.0, 40.0, 60.0)]);
        assert_eq!(canvas.get_pixel(2, 3), &BOX_COLOR);
        assert_eq!(canvas.get_pixel(10, 12), &BOX_COLOR);
        assert_eq!(canvas.get_pixel(6, 7), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(0, 19), &BOX_COLOR);
        assert_eq!(canvas.get_pixel(19, 15), &BOX_COLOR);
    }

    #[test]
    fn saves_annotated_png() {
        let parent = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::at(parent.path().join("run")).expect("layout");
        let image = RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]));
        let path = layout
            .save_promising("https://example.com/x/face.PNG", &image)
            .expect("save");
        assert_eq!(path, layout.promising_dir().join("example.com.x.face.png"));
        let reloaded = image::open(&path).expect("reopen").to_rgb8();
        assert_eq!(reloaded.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }
}
