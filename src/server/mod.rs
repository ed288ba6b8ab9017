pub mod http;
pub mod range;

pub use http::{local_ip, RangeFileServer};
pub use range::{parse_range, RangeRequest};
