//! The binary's umbrella error type. Every library module keeps its own `snafu` error; this
//! wraps each with `context(...)` plus the cross-cutting kinds that don't originate in a single
//! module. `main` prints only this type's `Display`, never its `Debug`.

use snafu::Snafu;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("{source}"))]
    Config { source: crate::config::error::Error },

    #[snafu(display("{source}"))]
    Descriptor {
        source: crate::descriptor::error::Error,
    },

    #[snafu(display("{source}"))]
    Graph { source: crate::graph::error::Error },

    #[snafu(display("{source}"))]
    Package {
        source: crate::resolve::package::error::Error,
    },

    #[snafu(display("{source}"))]
    Image { source: crate::resolve::image::error::Error },

    #[snafu(display("{source}"))]
    Generate { source: crate::generate::error::Error },

    #[snafu(display("{source}"))]
    Orchestrate {
        source: crate::orchestrate::error::Error,
    },

    #[snafu(display("{source}"))]
    Workflow { source: crate::workflow::error::Error },

    #[snafu(display("{source}"))]
    Fs { source: crate::fs::error::Error },

    #[snafu(display("{source}"))]
    Builder { source: crate::builder::error::Error },

    #[snafu(display("Image tool unavailable: {source}"))]
    ImageTool { source: oci_cli_wrapper::error::Error },

    #[snafu(display("one or more containers failed to build:\n{message}"))]
    BuildFailed { message: String },

    #[snafu(display("Failed to push one or more images:\n{message}"))]
    PushFailed { message: String },

    #[snafu(display("Build cache error: {message}"))]
    CacheIO { message: String },
}
