/// Specifies how a single array dimension is distributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DimDistribution {
    /// Dimension is sharded along the given compute axis.
    Sharded(usize),
    /// Dimension is replicated (not sharded).
    Replicated,
}

/// Partitioning of a `DC`-dimensional computation across devices.
///
/// Axis `0` is the highest-order compute axis (`z` for a 3-D grid) and axis
/// `DC - 1` the lowest-order one (`x`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeConf<const DC: usize> {
    /// Whether each compute axis is split across devices.
    pub partitioned: [bool; DC],
    /// Number of devices, `0` for every available device.
    pub procs: usize,
}

impl<const DC: usize> ComputeConf<DC> {
    /// Creates a compute configuration.
    pub fn new(partitioned: [bool; DC], procs: usize) -> Self {
        Self { partitioned, procs }
    }

    /// A computation that runs on a single device without partitioning.
    pub fn none() -> Self {
        Self::new([false; DC], 1)
    }

    /// Number of partitioned compute axes.
    pub fn part_dims(&self) -> usize {
        self.partitioned.iter().filter(|part| **part).count()
    }

    /// Returns the configuration with `procs` replaced by a resolved device count.
    pub fn with_procs(self, procs: usize) -> Self {
        Self { procs, ..self }
    }
}

impl<const DC: usize> Default for ComputeConf<DC> {
    fn default() -> Self {
        Self::none()
    }
}

/// Correspondence between the axes of a computation and the axes of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeMapping<const DC: usize, const D: usize> {
    /// Partitioning of the computation.
    pub comp: ComputeConf<DC>,
    /// Distribution pattern for each array dimension.
    pub dims: [DimDistribution; D],
}

impl<const DC: usize, const D: usize> ComputeMapping<DC, D> {
    /// Creates a mapping.
    pub fn new(comp: ComputeConf<DC>, dims: [DimDistribution; D]) -> Self {
        Self { comp, dims }
    }

    /// Maps array dimension `d` to compute axis `d` for every partitioned compute axis.
    ///
    /// Only meaningful when the array and the computation have the same rank.
    pub fn identity(comp: ComputeConf<DC>) -> Self {
        let dims = core::array::from_fn(|dim| match comp.partitioned.get(dim) {
            Some(true) => DimDistribution::Sharded(dim),
            _ => DimDistribution::Replicated,
        });
        Self { comp, dims }
    }

    /// Number of sharded array dimensions.
    pub fn array_part_dims(&self) -> usize {
        self.dims
            .iter()
            .filter(|dist| matches!(dist, DimDistribution::Sharded(_)))
            .count()
    }

    /// Compute axis each array dimension follows, if any.
    pub fn array_to_comp(&self) -> [Option<usize>; D] {
        self.dims.map(|dist| match dist {
            DimDistribution::Sharded(axis) => Some(axis),
            DimDistribution::Replicated => None,
        })
    }

    /// Number of devices requested by the computation.
    pub fn procs(&self) -> usize {
        self.comp.procs
    }
}

/// Resolves a requested device count against the devices that are available.
///
/// `0` selects every available device; larger requests are clamped.
pub fn resolve_procs(requested: usize, available: usize) -> usize {
    if requested == 0 {
        return available.max(1);
    }
    if requested > available {
        log::warn!("requested {requested} devices, but only {available} are available");
        return available.max(1);
    }
    requested
}
