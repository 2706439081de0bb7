pub mod event;
pub mod time;
pub mod value;

pub use event::{Bucket, BucketConfig, Event, EventData, EventInput};
pub use time::{parse_instant, parse_instant_or_now};
pub use value::Value;
