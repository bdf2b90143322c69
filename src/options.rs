use crate::error::{Error, Result};

/// Tree shape and cache tuning knobs. The defaults match the geometry the
/// engine was originally tuned for: 64 KiB pages holding ~20 node slots,
/// with a hundred-page write-back window per cache tier.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
	pub page_size: usize,          // Size in bytes of one page in the page file.
	pub nodes_per_page: usize,     // Target number of node slots packed into one node page.
	pub node_cache_capacity: usize, // Object-cache capacity in nodes; 0 picks max(100, branching * 3).
	pub page_cache_capacity: usize, // Block-cache capacity in node pages.
	pub data_cache_capacity: usize, // Data-page cache capacity (unclustered trees only).
	pub cache_factor: f32,         // Fraction of a full block cache kept on eviction; the rest is discarded.
}

impl Default for Options {
	fn default() -> Self {
		Self {
			page_size: 64 * 1024,
			nodes_per_page: 20,
			node_cache_capacity: 0,
			page_cache_capacity: 100,
			data_cache_capacity: 100,
			cache_factor: 0.6,
		}
	}
}

impl Options {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reject geometry the engine cannot operate on before any file is
	/// created. Slot capacities are checked later, once the key and value
	/// widths are known (they depend on the first inserted pair).
	pub fn validate(&self) -> Result<()> {
		if self.page_size < 64 {
			return Err(Error::InvalidArgument(format!(
				"page_size {} is below the 64 byte minimum",
				self.page_size
			)));
		}
		if self.nodes_per_page == 0 {
			return Err(Error::InvalidArgument("nodes_per_page must be at least 1".into()));
		}
		if self.page_cache_capacity < 2 {
			return Err(Error::InvalidArgument("page_cache_capacity must be at least 2".into()));
		}
		if self.data_cache_capacity < 2 {
			return Err(Error::InvalidArgument("data_cache_capacity must be at least 2".into()));
		}
		if !(self.cache_factor > 0.0 && self.cache_factor < 1.0) {
			return Err(Error::InvalidArgument(format!(
				"cache_factor {} must lie strictly between 0 and 1",
				self.cache_factor
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_log::test;

	#[test]
	fn default_options_validate() {
		Options::default().validate().unwrap();
	}

	#[test]
	fn rejects_degenerate_geometry() {
		let mut opts = Options::default();
		opts.page_size = 16;
		assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));

		let mut opts = Options::default();
		opts.cache_factor = 1.0;
		assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));

		let mut opts = Options::default();
		opts.nodes_per_page = 0;
		assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));
	}
}
