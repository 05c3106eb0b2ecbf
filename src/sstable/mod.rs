//! On-disk sorted-table structures. Only the block layer lives here; the
//! table container (index block, footer, filters) is built on top of it.

pub mod block;
