//! Element trees and the metamodel type system.

pub mod element;
pub mod metamodel;

pub use element::{file_key, ElementRef, ElementTree, FileLocator, ParsedElement, TypeRef};
pub use metamodel::{
    AttributeDef, DerivedAttributeSpec, DerivedDef, FeatureDef, Metamodel, MetamodelRegistry,
    ReferenceDef, TypeDef,
};
