use std::fmt;

/// Failure kinds produced by the private loader.
///
/// Every variant maps one-to-one onto an error kind from the loader's
/// design: nothing here is an exception, loader operations always
/// return one of these (or succeed) and never panic on malformed input.
#[derive(Debug)]
pub enum LoaderError {
    /// The resolver or mapper could not open the backing file.
    FileNotFound(std::io::Error),
    /// The image must be relocated but carries no relocation directory.
    NotRelocatable,
    /// The relocation engine could not apply a fixup (unsupported type,
    /// or a relocation target outside the mapped image).
    RelocationFailed,
    /// An import or export directory is out of bounds, truncated, or
    /// otherwise unreadable.
    MalformedImage(&'static str),
    /// A declared non-goal was encountered: ordinal imports, a forwarder
    /// chain that exceeds the bounded length budget, or a TLS directory
    /// on a DLL.
    UnsupportedFeature(&'static str),
    /// A transitive dependency could not be located or loaded.
    DependencyNotFound(String),
    /// A module's entry point returned `FALSE` on `DLL_PROCESS_ATTACH`.
    EntryPointFailure(String),
    /// A fixed-capacity table (bootstrap array, search-path array, path
    /// buffer) has no room left.
    ResourceExhaustion(&'static str),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::FileNotFound(e) => write!(f, "could not open image file: {e}"),
            LoaderError::NotRelocatable => {
                write!(f, "image requires relocation but has no relocation directory")
            }
            LoaderError::RelocationFailed => write!(f, "base relocation could not be applied"),
            LoaderError::MalformedImage(what) => write!(f, "malformed image: {what}"),
            LoaderError::UnsupportedFeature(what) => write!(f, "unsupported feature: {what}"),
            LoaderError::DependencyNotFound(name) => {
                write!(f, "dependency could not be located or loaded: {name}")
            }
            LoaderError::EntryPointFailure(name) => {
                write!(f, "entry point returned failure on DLL_PROCESS_ATTACH: {name}")
            }
            LoaderError::ResourceExhaustion(what) => write!(f, "resource exhausted: {what}"),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoaderError::FileNotFound(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
