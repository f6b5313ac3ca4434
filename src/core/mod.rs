// Domain-layer modules and shared errors/models
pub mod diff {
    pub use crate::diff::*;
}

pub mod migration {
    pub use crate::migration::*;
}

pub mod sweep {
    pub use crate::sweep::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
