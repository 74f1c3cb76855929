//! Generated protobuf modules
//!
//! build.rs compiles the Meshtastic serial API subset under `protos/`; prost emits
//! one file per package (meshtastic.rs).

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
