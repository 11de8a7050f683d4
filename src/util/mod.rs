pub mod file_formats;
pub mod http_dates;
