pub mod client;
pub mod model;

pub use client::{ApiError, AutoSelectClient, RetryPolicy, UploadItem};
pub use model::{
    CheckoutResponse, CheckoutVerification, JobState, JobStatusResponse, ManifestEntry,
    PricingResponse,
};
