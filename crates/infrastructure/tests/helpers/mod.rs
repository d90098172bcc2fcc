pub mod builders;
pub mod dns_server_mock;

pub use builders::{query, queries, ConfigBuilder, CountingDialer};
pub use dns_server_mock::{MockDnsServer, MockOptions, ANSWER_IP};
