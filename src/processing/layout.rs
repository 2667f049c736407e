use crate::events::Viewport;

/// How the source image and its depth map are arranged next to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairLayout {
    /// Side by side.
    Row,
    /// Stacked.
    Column,
}

impl PairLayout {
    /// Aspect ratio of the box holding two same-size images of `aspect_ratio`.
    pub fn combined_aspect_ratio(self, aspect_ratio: f64) -> f64 {
        match self {
            Self::Row => aspect_ratio * 2.0,
            Self::Column => aspect_ratio / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutPlan {
    pub layout: PairLayout,
    /// Bounding box of both images, centered in the viewport.
    pub pair: Rect,
    /// Source image first, depth map second.
    pub images: [Rect; 2],
}

fn usable(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Largest `ratio`-shaped rectangle inside the area: fit to full width, then
/// shrink to the height if that overflows.
pub fn fit_to_area(ratio: f64, area_width: f64, area_height: f64) -> (f64, f64) {
    if !usable(ratio) || !usable(area_width) || !usable(area_height) {
        return (0.0, 0.0);
    }
    let mut width = area_width;
    let mut height = width / ratio;
    if height > area_height {
        height = area_height;
        width = height * ratio;
    }
    (width, height)
}

pub fn covered_area(layout: PairLayout, aspect_ratio: f64, area_width: f64, area_height: f64) -> f64 {
    let (w, h) = fit_to_area(
        layout.combined_aspect_ratio(aspect_ratio),
        area_width,
        area_height,
    );
    w * h
}

/// Picks the arrangement covering more of the area. Ties, including every
/// degenerate input, go to `Row`. No state is kept between calls.
pub fn select_layout(aspect_ratio: f64, area_width: f64, area_height: f64) -> PairLayout {
    let row = covered_area(PairLayout::Row, aspect_ratio, area_width, area_height);
    let column = covered_area(PairLayout::Column, aspect_ratio, area_width, area_height);
    if column > row {
        PairLayout::Column
    } else {
        PairLayout::Row
    }
}

pub fn center_offset(inner_w: f64, inner_h: f64, outer_w: f64, outer_h: f64) -> (f64, f64) {
    let ox = ((outer_w - inner_w) / 2.0).max(0.0);
    let oy = ((outer_h - inner_h) / 2.0).max(0.0);
    (ox, oy)
}

pub fn plan_layout(aspect_ratio: f64, viewport: Viewport) -> LayoutPlan {
    let area_w = f64::from(viewport.width);
    let area_h = f64::from(viewport.height);
    let layout = select_layout(aspect_ratio, area_w, area_h);
    let (pair_w, pair_h) = fit_to_area(layout.combined_aspect_ratio(aspect_ratio), area_w, area_h);
    let (x, y) = center_offset(pair_w, pair_h, area_w, area_h);
    let pair = Rect {
        x,
        y,
        width: pair_w,
        height: pair_h,
    };
    let images = match layout {
        PairLayout::Row => {
            let half = pair_w / 2.0;
            [
                Rect { width: half, ..pair },
                Rect {
                    x: x + half,
                    width: half,
                    ..pair
                },
            ]
        }
        PairLayout::Column => {
            let half = pair_h / 2.0;
            [
                Rect { height: half, ..pair },
                Rect {
                    y: y + half,
                    height: half,
                    ..pair
                },
            ]
        }
    };
    LayoutPlan {
        layout,
        pair,
        images,
    }
}
