pub mod clock;
pub mod metadata_store;
pub mod object_store;
pub mod reaper;
pub mod share_service;
pub mod short_code;
pub mod validation;
