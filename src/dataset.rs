//! Face image corpus: building the byte cache from a directory of images and loading
//! normalized (optionally chunked) views of it
//!
//! The cache is a single safetensors file holding one `U8` tensor of shape
//! `[images, height * width * channels]` under [`IMAGES_KEY`]. Each row is an HWC crop.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

use image::{DynamicImage, GenericImageView, imageops::FilterType};
use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use safetensors::{Dtype, SafeTensorError, SafeTensors, tensor::TensorView};
use thiserror::Error;

use crate::config::{CacheMode, DatasetConfig};

/// Key of the image array inside the cache container
pub const IMAGES_KEY: &str = "images";

/// Number of images in the aligned Celeb-A release
pub const CELEB_A_IMAGES: usize = 202_599;

/// Errors for building and loading the image cache
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Found {found} images but the corpus has {expected}")]
    CorpusSizeMismatch { expected: usize, found: usize },
    #[error("Image {path} is {height} pixels tall after resizing, need at least {required}")]
    ImageTooShort {
        path: PathBuf,
        height: u32,
        required: usize,
    },
    #[error("Unsupported channel count {0}, expected 1, 3 or 4")]
    UnsupportedChannels(usize),
    #[error("Cache container error: {0}")]
    Container(#[from] SafeTensorError),
    #[error("Cache has no `{0}` array")]
    MissingKey(String),
    #[error("Cache array has dtype {0:?}, expected U8")]
    DtypeMismatch(Dtype),
    #[error("Cache rows hold {found} bytes but the configured geometry {shape} needs {expected}")]
    GeometryMismatch {
        shape: ImageShape,
        expected: usize,
        found: usize,
    },
    #[error("Chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("Cache is empty")]
    EmptyCache,
    #[error("Write mode needs a source image directory")]
    MissingImageDir,
}

/// Geometry of a single cached image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Bytes per flattened image
    pub fn row_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::new(32, 32, 3)
    }
}

impl Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Lists the files in `dir` with the given extension (case insensitive), sorted by path
pub fn list_images(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Resizes to the target width keeping the aspect ratio, center crops to the target height
/// and flattens the result to HWC bytes
pub fn preprocess_image(img: &DynamicImage, path: &Path, shape: ImageShape) -> Result<Vec<u8>, DatasetError> {
    let (orig_w, orig_h) = img.dimensions();
    let w = shape.width as u32;
    let new_h = (orig_h as u64 * w as u64 / orig_w.max(1) as u64) as u32;
    if (new_h as usize) < shape.height {
        return Err(DatasetError::ImageTooShort {
            path: path.to_path_buf(),
            height: new_h,
            required: shape.height,
        });
    }
    let resized = img.resize_exact(w, new_h, FilterType::Triangle);
    // ties round to even
    let margin = ((new_h as f64 - shape.height as f64) / 2.0).round_ties_even() as u32;
    let cropped = resized.crop_imm(0, margin, w, shape.height as u32);
    match shape.channels {
        1 => Ok(cropped.to_luma8().into_raw()),
        3 => Ok(cropped.to_rgb8().into_raw()),
        4 => Ok(cropped.to_rgba8().into_raw()),
        c => Err(DatasetError::UnsupportedChannels(c)),
    }
}

/// The preprocessed corpus, one flattened image per row
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCache {
    shape: ImageShape,
    data: Vec<u8>,
}

impl ImageCache {
    /// Wraps a row major byte buffer, which must hold a whole number of rows
    pub fn new(shape: ImageShape, data: Vec<u8>) -> Result<Self, DatasetError> {
        let row_len = shape.row_len();
        if row_len == 0 || data.len() % row_len != 0 {
            return Err(DatasetError::GeometryMismatch {
                shape,
                expected: row_len,
                found: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Decodes every image with `extension` in `dir` into a cache. Fails before decoding
    /// anything if the number of files differs from `expected_images`.
    pub fn build(
        dir: &Path,
        extension: &str,
        shape: ImageShape,
        expected_images: Option<usize>,
    ) -> Result<Self, DatasetError> {
        let files = list_images(dir, extension)?;
        log::info!("Image size : [{}, {}]", files.len(), shape.row_len());
        if let Some(expected) = expected_images {
            if files.len() != expected {
                return Err(DatasetError::CorpusSizeMismatch {
                    expected,
                    found: files.len(),
                });
            }
        }

        let mut data = Vec::with_capacity(files.len() * shape.row_len());
        for (n, path) in files.iter().enumerate() {
            let img = image::open(path).map_err(|source| DatasetError::Image {
                path: path.clone(),
                source,
            })?;
            data.extend(preprocess_image(&img, path, shape)?);
            if (n + 1) % 10_000 == 0 {
                log::info!("Processed {}/{} images", n + 1, files.len());
            }
        }
        Self::new(shape, data)
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.data.len() / self.shape.row_len()
    }

    pub fn row(&self, index: usize) -> &[u8] {
        let row_len = self.shape.row_len();
        &self.data[index * row_len..(index + 1) * row_len]
    }

    /// Writes the cache to a safetensors container, the geometry goes in the header metadata
    pub fn write(&self, path: &Path) -> Result<(), DatasetError> {
        let view = TensorView::new(Dtype::U8, vec![self.rows(), self.shape.row_len()], &self.data)?;
        let metadata = HashMap::from([
            ("height".to_string(), self.shape.height.to_string()),
            ("width".to_string(), self.shape.width.to_string()),
            ("channels".to_string(), self.shape.channels.to_string()),
        ]);
        let bytes = safetensors::serialize([(IMAGES_KEY, view)], Some(metadata))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        log::info!("Wrote {} images to '{}'", self.rows(), path.display());
        Ok(())
    }

    /// Reads a cache written by [`Self::write`], checking rows against `shape`
    pub fn read(path: &Path, shape: ImageShape) -> Result<Self, DatasetError> {
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)?;
        let view = tensors
            .tensor(IMAGES_KEY)
            .map_err(|_| DatasetError::MissingKey(IMAGES_KEY.to_string()))?;
        if view.dtype() != Dtype::U8 {
            return Err(DatasetError::DtypeMismatch(view.dtype()));
        }
        let found = view.shape().get(1).copied().unwrap_or(0);
        if view.shape().len() != 2 || found != shape.row_len() {
            return Err(DatasetError::GeometryMismatch {
                shape,
                expected: shape.row_len(),
                found,
            });
        }
        Self::new(shape, view.data().to_vec())
    }
}

/// Selects the `index`-th contiguous block of `size` rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub size: usize,
    pub index: usize,
}

/// Rows covered by a chunk. Indices past the last chunk wrap around and the last chunk is
/// clipped to the end of the cache, both with a notice.
pub fn chunk_range(total: usize, chunk: ChunkSpec) -> Result<Range<usize>, DatasetError> {
    if chunk.size == 0 {
        return Err(DatasetError::ZeroChunkSize);
    }
    if total == 0 {
        return Err(DatasetError::EmptyCache);
    }
    let n_chunks = total.div_ceil(chunk.size);
    let mut index = chunk.index;
    if index >= n_chunks {
        log::warn!("Chunk {} is past the last chunk {}, looping from back to start", index, n_chunks - 1);
        index %= n_chunks;
    }
    let end = (index + 1) * chunk.size;
    if end > total {
        log::warn!("Not enough data available for a full chunk, clipping to end");
        return Ok(index * chunk.size..total);
    }
    Ok(index * chunk.size..end)
}

/// Images as floats in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct Images {
    shape: ImageShape,
    rows: Vec<Vec<f32>>,
}

impl Images {
    /// Normalizes the given rows of a cache by dividing by 255
    pub fn from_cache(cache: &ImageCache, range: Range<usize>) -> Self {
        let rows = range
            .map(|i| cache.row(i).iter().map(|b| *b as f32 / 255.0).collect())
            .collect();
        Self {
            shape: cache.shape(),
            rows,
        }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Shuffles with `seed` and holds out `round(len * split_rate)` images, returns
    /// `(train, test)`
    pub fn split(self, split_rate: f32, seed: u64) -> (Images, Images) {
        let shape = self.shape;
        let n_test = ((self.rows.len() as f32 * split_rate).round() as usize).min(self.rows.len());
        let mut rows = self.rows;
        rows.shuffle(&mut Pcg64Mcg::seed_from_u64(seed));
        let train = rows.split_off(n_test);
        (Images { shape, rows: train }, Images { shape, rows })
    }
}

/// Loads the cache at `path`, optionally restricted to one chunk, normalized to `[0, 1]`
pub fn load_images(
    path: &Path,
    shape: ImageShape,
    chunk: Option<ChunkSpec>,
) -> Result<Images, DatasetError> {
    let cache = ImageCache::read(path, shape)?;
    let range = match chunk {
        Some(chunk) => chunk_range(cache.rows(), chunk)?,
        None => 0..cache.rows(),
    };
    let images = Images::from_cache(&cache, range);
    log::info!("Image size : [{}, {}]", images.len(), shape.row_len());
    Ok(images)
}

/// Celeb-A faces split into train and test sets
pub struct CelebADataset {
    pub train: Images,
    pub test: Images,
}

impl CelebADataset {
    /// Builds the cache first in write mode, then loads and splits it
    pub fn open(config: &DatasetConfig) -> Result<Self, DatasetError> {
        match config.mode {
            CacheMode::Write => {
                let image_dir = config
                    .image_dir
                    .as_ref()
                    .ok_or(DatasetError::MissingImageDir)?;
                let cache = ImageCache::build(
                    image_dir,
                    &config.extension,
                    config.shape,
                    config.expected_images,
                )?;
                cache.write(&config.cache_path)?;
            }
            CacheMode::Read => {}
        }
        let images = load_images(&config.cache_path, config.shape, config.chunk)?;
        let (train, test) = images.split(config.split_rate, config.seed);
        log::info!("Split into {} train and {} test images", train.len(), test.len());
        Ok(Self { train, test })
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn cache_with_rows(rows: usize) -> ImageCache {
        let shape = ImageShape::new(1, 2, 1);
        let data = (0..rows * 2).map(|i| (i % 256) as u8).collect();
        ImageCache::new(shape, data).unwrap()
    }

    #[test]
    fn test_chunk_sizes_and_contents() {
        let cache = cache_with_rows(10);
        for size in 1..=12 {
            let n_chunks = 10usize.div_ceil(size);
            for index in 0..n_chunks {
                let range = chunk_range(10, ChunkSpec { size, index }).unwrap();
                let expected = if index == n_chunks - 1 {
                    10 - index * size
                } else {
                    size.min(10 - index * size)
                };
                assert_eq!(range.len(), expected);
                assert_eq!(range.start, index * size);

                let images = Images::from_cache(&cache, range.clone());
                for (row, i) in images.rows().iter().zip(range) {
                    let bytes = row.iter().map(|v| (v * 255.0).round() as u8).collect::<Vec<_>>();
                    assert_eq!(bytes, cache.row(i));
                }
            }
        }
    }

    #[test]
    fn test_chunk_index_wraps() {
        for size in [1, 3, 4, 10] {
            let n_chunks = 10usize.div_ceil(size);
            for index in n_chunks..3 * n_chunks {
                assert_eq!(
                    chunk_range(10, ChunkSpec { size, index }).unwrap(),
                    chunk_range(10, ChunkSpec { size, index: index % n_chunks }).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_chunk_errors() {
        assert!(matches!(
            chunk_range(10, ChunkSpec { size: 0, index: 0 }),
            Err(DatasetError::ZeroChunkSize)
        ));
        assert!(matches!(
            chunk_range(0, ChunkSpec { size: 2, index: 0 }),
            Err(DatasetError::EmptyCache)
        ));
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.safetensors");
        let shape = ImageShape::new(2, 2, 3);
        let data = (0..5 * 12).map(|i| (i * 37 % 256) as u8).collect::<Vec<_>>();
        let cache = ImageCache::new(shape, data).unwrap();
        cache.write(&path).unwrap();

        let read = ImageCache::read(&path, shape).unwrap();
        assert_eq!(read, cache);

        let images = load_images(&path, shape, None).unwrap();
        assert_eq!(images.len(), 5);
        for (row, i) in images.rows().iter().zip(0..) {
            assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
            let bytes = row.iter().map(|v| (v * 255.0).round() as u8).collect::<Vec<_>>();
            assert_eq!(bytes, cache.row(i));
        }

        let chunk = load_images(&path, shape, Some(ChunkSpec { size: 2, index: 5 })).unwrap();
        // 5 % 3 chunks = 2, the clipped last chunk of one row
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk.rows()[0], images.rows()[4]);

        assert!(matches!(
            ImageCache::read(&path, ImageShape::new(2, 2, 1)),
            Err(DatasetError::GeometryMismatch {
                expected: 4,
                found: 12,
                ..
            })
        ));
    }

    #[test]
    fn test_preprocess_resizes_then_center_crops() {
        // 4 wide, 12 tall, rows are banded by their y coordinate
        let img = RgbImage::from_fn(4, 12, |_, y| Rgb([(y * 20) as u8, 0, 0]));
        let img = DynamicImage::ImageRgb8(img);
        let shape = ImageShape::new(2, 2, 3);
        // resized to 2x6, margin round(4 / 2) = 2 keeps rows 2 and 3 of the resized image
        let bytes = preprocess_image(&img, Path::new("band.png"), shape).unwrap();
        assert_eq!(bytes.len(), shape.row_len());
        let top = bytes[0];
        let bottom = bytes[6];
        assert!(top > 50 && top < bottom && bottom < 180, "{top} {bottom}");

        let gray = preprocess_image(&img, Path::new("band.png"), ImageShape::new(2, 2, 1)).unwrap();
        assert_eq!(gray.len(), 4);

        let wide = DynamicImage::ImageRgb8(RgbImage::new(8, 2));
        assert!(matches!(
            preprocess_image(&wide, Path::new("wide.png"), ImageShape::new(2, 2, 3)),
            Err(DatasetError::ImageTooShort { height: 0, .. })
        ));
    }

    #[test]
    fn test_build_checks_corpus_size_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let img = RgbImage::from_pixel(6, 6, Rgb([i * 50, 100, 200]));
            img.save(dir.path().join(format!("{i:06}.png"))).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        let shape = ImageShape::new(4, 4, 3);

        assert!(matches!(
            ImageCache::build(dir.path(), "png", shape, Some(CELEB_A_IMAGES)),
            Err(DatasetError::CorpusSizeMismatch {
                expected: CELEB_A_IMAGES,
                found: 3
            })
        ));

        let cache = ImageCache::build(dir.path(), "png", shape, Some(3)).unwrap();
        assert_eq!(cache.rows(), 3);
        // flat colours survive resizing, sorted by file name
        assert_eq!(&cache.row(1)[..3], &[50, 100, 200]);
        assert_eq!(&cache.row(2)[..3], &[100, 100, 200]);
    }

    #[test]
    fn test_bad_file_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.png"), b"definitely not a png").unwrap();
        let err = ImageCache::build(dir.path(), "png", ImageShape::new(2, 2, 3), None).unwrap_err();
        assert!(matches!(err, DatasetError::Image { .. }));
    }

    #[test]
    fn test_open_write_mode_rebuilds_or_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.safetensors");
        let shape = ImageShape::new(4, 4, 3);
        ImageCache::new(shape, vec![7; 2 * shape.row_len()])
            .unwrap()
            .write(&cache_path)
            .unwrap();

        let mut config = DatasetConfig {
            image_dir: None,
            cache_path: cache_path.clone(),
            extension: "png".to_string(),
            shape,
            expected_images: None,
            mode: CacheMode::Write,
            split_rate: 0.0,
            ..Default::default()
        };
        // the stale cache on disk must not be served
        assert!(matches!(
            CelebADataset::open(&config),
            Err(DatasetError::MissingImageDir)
        ));

        let images = dir.path().join("images");
        fs::create_dir(&images).unwrap();
        for i in 0..3 {
            RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))
                .save(images.join(format!("{i}.png")))
                .unwrap();
        }
        config.image_dir = Some(images);
        let dataset = CelebADataset::open(&config).unwrap();
        assert_eq!(dataset.train.len(), 3);
        assert!(dataset.train.rows().iter().flatten().all(|v| *v == 0.0));

        config.mode = CacheMode::Read;
        config.image_dir = None;
        assert_eq!(CelebADataset::open(&config).unwrap().train.len(), 3);
    }

    #[test]
    fn test_split() {
        let cache = cache_with_rows(10);
        let images = Images::from_cache(&cache, 0..10);
        let (train, test) = images.clone().split(0.2, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);
        let mut all = train.rows().iter().chain(test.rows()).cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert_eq!(all, images.rows());

        let (train, test) = images.split(0.0, 42);
        assert_eq!(train.len(), 10);
        assert!(test.is_empty());
    }
}
