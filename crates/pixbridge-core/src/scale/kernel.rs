//! Resampling kernels offered by [`ResampleEngine`](super::ResampleEngine).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Filter kernel used when rescaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScaleKernel {
    /// Nearest neighbor interpolation (fastest, lowest quality).
    Nearest,
    /// Bilinear interpolation.
    Bilinear,
    /// Catmull-Rom cubic interpolation.
    CatmullRom,
    /// Gaussian smoothing.
    Gaussian,
    /// Lanczos with window 3 (slowest, sharpest).
    Lanczos3,
    /// Box filter weighting every source pixel by the area it covers.
    #[default]
    AreaAverage,
}

impl ScaleKernel {
    /// Every kernel, in order of increasing cost.
    pub const ALL: [ScaleKernel; 6] = [
        ScaleKernel::Nearest,
        ScaleKernel::Bilinear,
        ScaleKernel::AreaAverage,
        ScaleKernel::CatmullRom,
        ScaleKernel::Gaussian,
        ScaleKernel::Lanczos3,
    ];

    /// Name reported to callers.
    pub fn name(self) -> &'static str {
        match self {
            ScaleKernel::Nearest => "Nearest",
            ScaleKernel::Bilinear => "Bilinear",
            ScaleKernel::CatmullRom => "CatmullRom",
            ScaleKernel::Gaussian => "Gaussian",
            ScaleKernel::Lanczos3 => "Lanczos3",
            ScaleKernel::AreaAverage => "AreaAverage",
        }
    }

    /// Look up a kernel by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Convert to the image crate's FilterType.
    ///
    /// `AreaAverage` has no counterpart there and returns `None`.
    pub fn to_image_filter(self) -> Option<image::imageops::FilterType> {
        use image::imageops::FilterType;
        match self {
            ScaleKernel::Nearest => Some(FilterType::Nearest),
            ScaleKernel::Bilinear => Some(FilterType::Triangle),
            ScaleKernel::CatmullRom => Some(FilterType::CatmullRom),
            ScaleKernel::Gaussian => Some(FilterType::Gaussian),
            ScaleKernel::Lanczos3 => Some(FilterType::Lanczos3),
            ScaleKernel::AreaAverage => None,
        }
    }
}

impl fmt::Display for ScaleKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_ignores_case() {
        assert_eq!(ScaleKernel::from_name("areaaverage"), Some(ScaleKernel::AreaAverage));
        assert_eq!(ScaleKernel::from_name("LANCZOS3"), Some(ScaleKernel::Lanczos3));
        assert_eq!(ScaleKernel::from_name("bicubic"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for kernel in ScaleKernel::ALL {
            assert_eq!(ScaleKernel::from_name(&kernel.to_string()), Some(kernel));
        }
    }

    #[test]
    fn test_image_filter_mapping() {
        assert_eq!(
            ScaleKernel::Bilinear.to_image_filter(),
            Some(image::imageops::FilterType::Triangle)
        );
        assert_eq!(ScaleKernel::AreaAverage.to_image_filter(), None);
        assert_eq!(ScaleKernel::default(), ScaleKernel::AreaAverage);
    }
}
