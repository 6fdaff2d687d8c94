//! External service integrations.

pub mod services {
    pub use crate::services::*;
}

pub mod ai_client {
    pub use crate::ai_client::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}
