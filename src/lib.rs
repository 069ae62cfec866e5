extern crate apodize;
extern crate rustfft;

#[cfg(test)]
#[macro_use]
extern crate approx;

/// Declares a fieldless enum whose variants have a fixed textual name, used
/// both on the command line and inside artifact names.
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, String> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!(
                        "unknown value {:?}, expected one of: {}",
                        s,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

pub mod artifact;
pub mod audio;
pub mod beats;
pub mod chromagram;
pub mod config;
pub mod dsp;
pub mod error;
pub mod markers;
pub mod meter;
pub mod novelty;
pub mod npy;
pub mod pipeline;
pub mod tempogram;

pub use artifact::{ArtifactIndex, ArtifactKey, Stage};
pub use config::{
    BeatsConfig, ChromagramConfig, DataLayout, MeterConfig, NoveltyConfig, TempogramConfig,
};
pub use error::{Error, Result};
pub use pipeline::{BatchReport, ItemStatus, RunOptions};
