pub mod boundary;
pub mod labeling;
pub mod postprocess;

pub use boundary::{trace_region, to_multipolygon, LatticePoint, LatticePolygon};
pub use labeling::{FullExtentLabeler, RegionLabels, TiledLabeler};
pub use postprocess::{DouglasPeuckerSimplifier, GeometryValidator};
