//! Resolution independent field geometry.
//!
//! Field boxes are stored as percentages of the page's width and height with
//! the vertical axis measured from the top of the page. They are converted to
//! absolute units twice: to pixels for the editor/signing preview and to PDF
//! points (bottom-up) when baking. Both conversions must agree.

/// Upper bound of every percentage coordinate.
pub const FULL: f64 = 100.0;

/// A field box in percent of the page, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A page's MediaBox in PDF points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBox {
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: f64,
    pub height: f64,
}

/// A box in PDF user space, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A box in preview pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PageBox {
    /// Builds a page box from two opposite MediaBox corners in any order.
    pub fn from_corners(c1: (f64, f64), c2: (f64, f64)) -> Self {
        let ll = (c1.0.min(c2.0), c1.1.min(c2.1));
        let ur = (c1.0.max(c2.0), c1.1.max(c2.1));
        Self {
            origin_x: ll.0,
            origin_y: ll.1,
            width: ur.0 - ll.0,
            height: ur.1 - ll.1,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

impl PercentRect {
    /// Finite, inside `[0, 100]`, positive area and fully on the page.
    pub fn is_valid(&self) -> bool {
        let parts = [self.x, self.y, self.width, self.height];
        parts.iter().all(|v| v.is_finite() && (0.0..=FULL).contains(v))
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= FULL + f64::EPSILON * FULL
            && self.y + self.height <= FULL + f64::EPSILON * FULL
    }

    /// The part of this box that lies on the page, or `None` if nothing with
    /// positive area remains.
    pub fn clamped(&self) -> Option<PercentRect> {
        let parts = [self.x, self.y, self.width, self.height];
        if !parts.iter().all(|v| v.is_finite()) {
            return None;
        }
        let left = self.x.max(0.0);
        let top = self.y.max(0.0);
        let right = (self.x + self.width).min(FULL);
        let bottom = (self.y + self.height).min(FULL);
        if right <= left || bottom <= top {
            return None;
        }
        Some(PercentRect {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        })
    }

    pub fn to_pixels(&self, rendered_width: f64, rendered_height: f64) -> PixelRect {
        PixelRect {
            left: self.x / FULL * rendered_width,
            top: self.y / FULL * rendered_height,
            width: self.width / FULL * rendered_width,
            height: self.height / FULL * rendered_height,
        }
    }

    /// Converts to PDF user space, flipping the vertical axis.
    pub fn to_points(&self, page: &PageBox) -> PointRect {
        let width = self.width / FULL * page.width;
        let height = self.height / FULL * page.height;
        let x = page.origin_x + self.x / FULL * page.width;
        let y = page.origin_y + page.height - (self.y / FULL * page.height) - height;
        PointRect { x, y, width, height }
    }
}

impl PointRect {
    /// Inverse of [`PercentRect::to_points`].
    pub fn to_percent(&self, page: &PageBox) -> PercentRect {
        let x = (self.x - page.origin_x) / page.width * FULL;
        let height = self.height / page.height * FULL;
        let y = (page.origin_y + page.height - self.y - self.height) / page.height * FULL;
        PercentRect {
            x,
            y,
            width: self.width / page.width * FULL,
            height,
        }
    }
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}
