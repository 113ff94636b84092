pub mod formatting;
pub mod image_check;
pub mod instrument;
pub mod password;
pub mod timeframe;

pub use formatting::{tidy_response, truncate_for_message, Truncated};
pub use image_check::{check_chart_image, ChartFormat, ImageCheckError};
pub use instrument::{detect_instrument, Instrument};
pub use timeframe::{detect_timeframe, Timeframe};
