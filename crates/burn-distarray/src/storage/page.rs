use alloc::vec;
use alloc::vec::Vec;

use derive_new::new;

use crate::runtime::DeviceId;

/// Outcome of placing one granule.
#[derive(new, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
    /// Device owning the majority of the granule's elements.
    pub device: DeviceId,
    /// Elements of the granule that belong to `device`.
    pub local: usize,
    /// Elements of the granule that belong to other devices.
    pub remote: usize,
}

impl PageStats {
    /// Elements covered by the granule.
    pub fn total(&self) -> usize {
        self.local + self.remote
    }

    /// Fraction of the granule's elements not owned by its device.
    pub fn imbalance_ratio(&self) -> f64 {
        ratio(self.remote, self.total())
    }
}

fn ratio(remote: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        remote as f64 / total as f64
    }
}

/// Walks the aligned index space of an array in fixed-size granules and
/// assigns each granule to the device owning most of its elements.
///
/// The cursor is a mixed-radix counter over the aligned extents: the
/// lowest-order axis is consumed in runs that stop at tile boundaries, and a
/// run that reaches the end of the axis carries into the higher-order axes.
/// The walk is exhausted once the carry reaches the end of axis `0`.
#[derive(Debug, Clone)]
pub struct PageAllocator<const D: usize> {
    devices: usize,
    aligned: [usize; D],
    local_tile: [usize; D],
    last_tile: [usize; D],
    dim_to_device: [usize; D],
    granule: usize,
    cursor: [usize; D],
    exhausted: bool,
    pages: Vec<PageStats>,
}

impl<const D: usize> PageAllocator<D> {
    /// Creates an allocator positioned at the origin of the aligned index space.
    ///
    /// `granule` is the size of one granule in elements. Padding past the
    /// last tile of an axis is charged to that last tile.
    pub fn new(
        devices: usize,
        extents: [usize; D],
        aligned: [usize; D],
        local_tile: [usize; D],
        dim_to_device: [usize; D],
        granule: usize,
    ) -> Self {
        const { assert!(D > 0, "arrays need at least one dimension") };
        assert!(granule > 0, "granules must hold at least one element");

        let local_tile = local_tile.map(|tile| tile.max(1));
        let last_tile = core::array::from_fn(|dim| {
            extents[dim].div_ceil(local_tile[dim]).max(1) - 1
        });

        Self {
            devices: devices.max(1),
            aligned,
            local_tile,
            last_tile,
            dim_to_device,
            granule,
            cursor: [0; D],
            exhausted: aligned.contains(&0),
            pages: Vec::new(),
        }
    }

    /// Current position in the aligned index space.
    pub fn cursor(&self) -> &[usize; D] {
        &self.cursor
    }

    /// Whether every granule has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Every granule placed so far.
    pub fn pages(&self) -> &[PageStats] {
        &self.pages
    }

    /// Places the next granule.
    ///
    /// Returns `true` once the granule returned is the last one. After that,
    /// every call returns `(true, PageStats::default())` without moving.
    pub fn advance(&mut self) -> (bool, PageStats) {
        if self.exhausted {
            return (true, PageStats::default());
        }

        let last = D - 1;
        let mut counts = vec![0usize; self.devices];
        let mut remaining = self.granule;

        while remaining > 0 && !self.exhausted {
            let device = self.owner();

            // Elements left before the next tile boundary, clipped to the axis.
            let tile = self.local_tile[last];
            let mut run = tile - self.cursor[last] % tile;
            if self.cursor[last] + run >= self.aligned[last] {
                run = self.aligned[last] - self.cursor[last];
            }

            if remaining < run {
                self.cursor[last] += remaining;
                counts[device] += remaining;
                remaining = 0;
            } else {
                self.cursor[last] += run;
                counts[device] += run;
                remaining -= run;
                if self.cursor[last] == self.aligned[last] {
                    self.carry();
                }
            }
        }

        let mut majority = 0;
        for device in 1..self.devices {
            if counts[device] > counts[majority] {
                majority = device;
            }
        }
        let total: usize = counts.iter().sum();
        let page = PageStats::new(majority, counts[majority], total - counts[majority]);
        self.pages.push(page);

        (self.exhausted, page)
    }

    /// Fraction of all placed elements that live in a granule owned by another device.
    ///
    /// `0` when every tile boundary falls on a granule boundary.
    pub fn imbalance_ratio(&self) -> f64 {
        let (local, remote) = self
            .pages
            .iter()
            .fold((0, 0), |(local, remote), page| {
                (local + page.local, remote + page.remote)
            });
        ratio(remote, local + remote)
    }

    fn owner(&self) -> DeviceId {
        let device: DeviceId = (0..D)
            .map(|dim| {
                let tile = (self.cursor[dim] / self.local_tile[dim]).min(self.last_tile[dim]);
                tile * self.dim_to_device[dim]
            })
            .sum();
        device.min(self.devices - 1)
    }

    /// Moves the cursor from the end of the lowest-order axis to the start of
    /// the next row, rippling the carry towards axis `0`.
    fn carry(&mut self) {
        if D == 1 {
            self.exhausted = true;
            return;
        }

        self.cursor[D - 1] = 0;
        for dim in (0..D - 1).rev() {
            self.cursor[dim] += 1;
            if self.cursor[dim] < self.aligned[dim] {
                return;
            }
            if dim > 0 {
                self.cursor[dim] = 0;
            }
        }
        self.exhausted = true;
    }
}
