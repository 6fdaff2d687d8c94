// Domain-layer modules and shared errors/models
pub mod extractor {
    pub use crate::extractor::*;
}

pub mod aggregator {
    pub use crate::aggregator::*;
}

pub mod cache {
    pub use crate::cache::*;
}

pub mod scorer {
    pub use crate::scorer::*;
}

pub mod synthesizer {
    pub use crate::synthesizer::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
