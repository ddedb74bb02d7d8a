//! Moving archives to and from object storage.

pub mod download;
pub mod progress;
pub mod progress_stream;
pub mod upload;

pub use download::{download_url, verify_file, DownloadReport, Downloader, DOWNLOADING};
pub use progress::{format_bytes, format_duration, format_speed, RateMeter};
pub use progress_stream::{ProgressCallback, ProgressStream};
pub use upload::{plan_parts, PartPlan, UploadReport, Uploader, MAX_PART_ATTEMPTS, UPLOADING};
