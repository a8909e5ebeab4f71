//! Repository traits for metadata operations.

pub mod dedup;
pub mod direct;
pub mod notification;
pub mod uploads;

pub use dedup::DedupRepo;
pub use direct::DirectUploadRepo;
pub use notification::NotificationRepo;
pub use uploads::UploadRepo;
