use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Bits in a fingerprint.
pub const HASH_BITS: u32 = 64;
/// Grid edge for the mean-threshold algorithm (8x8 = 64 cells).
const GRID: u32 = 8;

/// Rec.601 luminance of one RGBA pixel.
fn luma(pixel: &[u8]) -> f64 {
    0.299 * f64::from(pixel[0]) + 0.587 * f64::from(pixel[1]) + 0.114 * f64::from(pixel[2])
}

/// Perceptual hash algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// 8x8 downscale, each cell thresholded against the grid mean.
    Mean,
    /// 9x8 downscale, one bit per horizontal neighbor comparison.
    Gradient,
}

/// A 64-bit perceptual fingerprint. Robust to minor re-encoding and
/// resizing; compared by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Derive a fingerprint from decoded pixels. Deterministic: identical
    /// pixels always produce identical bits. Zero-variance images are
    /// well-defined because cells tied at the mean contribute a 0 bit.
    pub fn from_image(image: &DynamicImage, algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Mean => Self::mean_hash(image),
            HashAlgorithm::Gradient => Self::gradient_hash(image),
        }
    }

    fn mean_hash(image: &DynamicImage) -> Self {
        let small = image
            .resize_exact(GRID, GRID, FilterType::Lanczos3)
            .to_rgba8();

        let mut cells = [0.0f64; (GRID * GRID) as usize];
        let mut sum = 0.0;
        for (i, pixel) in small.pixels().enumerate() {
            let value = luma(&pixel.0);
            cells[i] = value;
            sum += value;
        }
        let mean = sum / cells.len() as f64;

        let mut bits: u64 = 0;
        for (i, &value) in cells.iter().enumerate() {
            if value > mean {
                bits |= 1u64 << i;
            }
        }
        Fingerprint(bits)
    }

    fn gradient_hash(image: &DynamicImage) -> Self {
        // One extra column so every output bit has a right-hand neighbor.
        let small = image
            .resize_exact(GRID + 1, GRID, FilterType::Lanczos3)
            .to_rgba8();

        let mut bits: u64 = 0;
        let mut bit = 0;
        for y in 0..GRID {
            for x in 0..GRID {
                let left = luma(&small.get_pixel(x, y).0);
                let right = luma(&small.get_pixel(x + 1, y).0);
                if left > right {
                    bits |= 1u64 << bit;
                }
                bit += 1;
            }
        }
        Fingerprint(bits)
    }

    /// Hamming distance: number of differing bits.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Similarity percentage: `100 * (1 - distance / 64)`.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        100.0 * (1.0 - f64::from(self.distance(other)) / f64::from(HASH_BITS))
    }

    /// Slice the hash into `bands` equal segments; shared segment values
    /// are the locality-sensitive bucketing key for candidate generation.
    pub fn band(&self, index: u32, bands: u32) -> u64 {
        debug_assert!(bands > 0 && HASH_BITS % bands == 0);
        let width = HASH_BITS / bands;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        (self.0 >> (index * width)) & mask
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        u64::from_str_radix(hex, 16).ok().map(Fingerprint)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Persisted as a hex string so cache values stay readable and stable.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint hex: {hex}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn gradient_image(width: u32, height: u32, shift: u32) -> DynamicImage {
        // Smooth diagonal ramp; shifting it by one pixel barely moves the
        // downscaled grid.
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let v = ((x + shift + y) / 2).min(255) as u8;
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn solid_image(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(64, 64, Rgb([value, value, value])))
    }

    #[test]
    fn hashing_is_deterministic() {
        let img = gradient_image(128, 128, 0);
        for algorithm in [HashAlgorithm::Mean, HashAlgorithm::Gradient] {
            let a = Fingerprint::from_image(&img, algorithm);
            let b = Fingerprint::from_image(&img, algorithm);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn solid_color_hashes_to_zero_without_error() {
        for value in [0u8, 127, 255] {
            let hash = Fingerprint::from_image(&solid_image(value), HashAlgorithm::Mean);
            assert_eq!(hash.0, 0, "ties at the mean must produce 0 bits");
        }
    }

    #[test]
    fn one_pixel_shift_stays_above_ninety_percent() {
        let original = gradient_image(256, 256, 0);
        let shifted = gradient_image(256, 256, 1);
        for algorithm in [HashAlgorithm::Mean, HashAlgorithm::Gradient] {
            let a = Fingerprint::from_image(&original, algorithm);
            let b = Fingerprint::from_image(&shifted, algorithm);
            assert!(
                a.similarity(&b) >= 90.0,
                "{algorithm:?} similarity {} below 90%",
                a.similarity(&b)
            );
        }
    }

    #[test]
    fn distance_and_similarity_agree() {
        let a = Fingerprint(0);
        let b = Fingerprint(0b11);
        assert_eq!(a.distance(&b), 2);
        assert!((a.similarity(&b) - (100.0 * 62.0 / 64.0)).abs() < 1e-9);
        assert_eq!(a.similarity(&a), 100.0);
        assert_eq!(a.similarity(&Fingerprint(u64::MAX)), 0.0);
    }

    #[test]
    fn bands_cover_all_bits() {
        let hash = Fingerprint(0xDEAD_BEEF_CAFE_F00D);
        let rebuilt = (0..4).fold(0u64, |acc, i| acc | (hash.band(i, 4) << (i * 16)));
        assert_eq!(rebuilt, hash.0);
    }

    #[test]
    fn hex_round_trip() {
        let hash = Fingerprint(0x0123_4567_89AB_CDEF);
        assert_eq!(Fingerprint::from_hex(&hash.to_hex()), Some(hash));

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"0123456789abcdef\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
