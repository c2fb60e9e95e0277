//! JSON Patch engine: validation, application and inversion

pub mod applier;
pub mod document;
pub mod inverse;
pub mod pointer;
pub mod validator;

pub use applier::apply;
pub use document::{PatchDocument, PatchOperation, Verb};
pub use inverse::build_inverse;
pub use pointer::Pointer;
pub use validator::{ValidatedPatch, validate, validate_document};
