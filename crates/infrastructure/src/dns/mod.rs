pub mod codec;
pub mod transport;
pub mod upstream;

pub use transport::{Dialer, PoolStats, RawConnection};
pub use upstream::{FastUpstream, FastUpstreamBuilder, UpstreamStats};
