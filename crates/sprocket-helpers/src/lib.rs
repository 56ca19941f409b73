pub mod backoff;
pub mod de;
pub mod logging;
pub mod shutdown;
