//! Decomposition of a change mask into outer connected regions.
//!
//! Changed pixels are grouped with 8-connectivity using a two-pass labeling
//! with union-find. Components sitting inside a hole of another component
//! are dropped, so only outer boundaries produce regions.

use std::collections::VecDeque;

use super::diff::ChangeMask;

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Integer center, rounding toward the top-left.
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    outer: bool,
}

impl Bounds {
    fn at(x: usize, y: usize) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            outer: false,
        }
    }

    fn include(&mut self, x: usize, y: usize) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    fn to_region(self) -> Region {
        Region::new(
            self.min_x as u32,
            self.min_y as u32,
            (self.max_x - self.min_x + 1) as u32,
            (self.max_y - self.min_y + 1) as u32,
        )
    }
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

fn union_labels(parents: &mut [usize], a: usize, b: usize) {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    if root_a < root_b {
        parents[root_b] = root_a;
    } else if root_b < root_a {
        parents[root_a] = root_b;
    }
}

/// Label changed pixels with 8-connectivity.
///
/// Returns the per-pixel label image (0 = background, components numbered
/// from 1 in raster order of their first pixel) and the component count.
pub fn label_components(mask: &ChangeMask) -> (Vec<usize>, usize) {
    let w = mask.width() as usize;
    let h = mask.height() as usize;
    let pixels = mask.image.as_raw();
    let mut labels = vec![0usize; w * h];
    let mut parents = vec![0usize];

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if pixels[idx] == 0 {
                continue;
            }

            // Already visited neighbors: W, NW, N, NE.
            let mut neighbors = [0usize; 4];
            if x > 0 {
                neighbors[0] = labels[idx - 1];
            }
            if y > 0 {
                let up = idx - w;
                if x > 0 {
                    neighbors[1] = labels[up - 1];
                }
                neighbors[2] = labels[up];
                if x + 1 < w {
                    neighbors[3] = labels[up + 1];
                }
            }

            let min_label = neighbors.iter().copied().filter(|&l| l > 0).min();
            match min_label {
                None => {
                    let label = parents.len();
                    parents.push(label);
                    labels[idx] = label;
                }
                Some(min_label) => {
                    labels[idx] = min_label;
                    for &n in neighbors.iter().filter(|&&l| l > 0 && l != min_label) {
                        union_labels(&mut parents, min_label, n);
                    }
                }
            }
        }
    }

    let mut relabel = vec![0usize; parents.len()];
    let mut count = 0;
    for label in 1..parents.len() {
        let root = find_root(&mut parents, label);
        if relabel[root] == 0 {
            count += 1;
            relabel[root] = count;
        }
        relabel[label] = relabel[root];
    }

    for label in labels.iter_mut().filter(|l| **l > 0) {
        *label = relabel[*label];
    }

    (labels, count)
}

/// Background pixels 4-connected to the image border.
fn outside_background(labels: &[usize], w: usize, h: usize) -> Vec<bool> {
    let mut outside = vec![false; w * h];
    let mut queue = VecDeque::new();

    let seed = |x: usize, y: usize, outside: &mut [bool], queue: &mut VecDeque<usize>| {
        let idx = y * w + x;
        if labels[idx] == 0 && !outside[idx] {
            outside[idx] = true;
            queue.push_back(idx);
        }
    };
    for x in 0..w {
        seed(x, 0, &mut outside, &mut queue);
        seed(x, h - 1, &mut outside, &mut queue);
    }
    for y in 0..h {
        seed(0, y, &mut outside, &mut queue);
        seed(w - 1, y, &mut outside, &mut queue);
    }

    while let Some(idx) = queue.pop_front() {
        let (x, y) = (idx % w, idx / w);
        let mut visit = |n: usize| {
            if labels[n] == 0 && !outside[n] {
                outside[n] = true;
                queue.push_back(n);
            }
        };
        if x > 0 {
            visit(idx - 1);
        }
        if x + 1 < w {
            visit(idx + 1);
        }
        if y > 0 {
            visit(idx - w);
        }
        if y + 1 < h {
            visit(idx + w);
        }
    }

    outside
}

/// Extract the bounding boxes of all outer connected regions in `mask`.
pub fn extract_regions(mask: &ChangeMask) -> Vec<Region> {
    let w = mask.width() as usize;
    let h = mask.height() as usize;
    if w == 0 || h == 0 {
        return Vec::new();
    }

    let (labels, count) = label_components(mask);
    if count == 0 {
        return Vec::new();
    }

    let outside = outside_background(&labels, w, h);
    let mut bounds: Vec<Option<Bounds>> = vec![None; count + 1];

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let label = labels[idx];
            if label == 0 {
                continue;
            }

            let b = bounds[label].get_or_insert_with(|| Bounds::at(x, y));
            b.include(x, y);

            if !b.outer {
                let on_border = x == 0 || y == 0 || x + 1 == w || y + 1 == h;
                let touches_outside = on_border
                    || outside[idx - 1]
                    || outside[idx + 1]
                    || outside[idx - w]
                    || outside[idx + w];
                b.outer = touches_outside;
            }
        }
    }

    bounds
        .into_iter()
        .flatten()
        .filter(|b| b.outer)
        .map(Bounds::to_region)
        .collect()
}
