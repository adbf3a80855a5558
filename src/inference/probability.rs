/// Per-pixel class probabilities.
///
/// Layout: height x width x classes, `f32`, row-major, channel-last. Each
/// pixel's values are a softmax over the class axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    data: Vec<f32>,
    height: usize,
    width: usize,
    classes: usize,
}

impl ProbabilityMap {
    /// Wrap channel-last data. Returns `None` on a length mismatch or when
    /// there are no classes.
    pub fn new(data: Vec<f32>, height: usize, width: usize, classes: usize) -> Option<Self> {
        (classes > 0 && data.len() == height * width * classes).then_some(Self {
            data,
            height,
            width,
            classes,
        })
    }

    /// Build a map by evaluating `f(y, x)` for every pixel.
    ///
    /// `f` must return exactly `classes` values; shorter rows are padded with
    /// zeros and longer rows truncated. Returns `None` when `classes` is zero.
    pub fn from_fn<F>(height: usize, width: usize, classes: usize, mut f: F) -> Option<Self>
    where
        F: FnMut(usize, usize) -> Vec<f32>,
    {
        if classes == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(height * width * classes);
        for y in 0..height {
            for x in 0..width {
                let mut row = f(y, x);
                row.resize(classes, 0.0);
                data.extend_from_slice(&row);
            }
        }
        Some(Self {
            data,
            height,
            width,
            classes,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Class probabilities at a pixel.
    #[inline]
    pub fn pixel(&self, y: usize, x: usize) -> &[f32] {
        let start = (y * self.width + x) * self.classes;
        &self.data[start..start + self.classes]
    }

    /// Iterate over pixels in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.classes)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
