mod chart;
mod errors;
mod imageset;
mod list;

pub mod dependencies;
pub mod renderer;
pub mod scanner;
pub mod scheduler;
pub mod values;

pub use chart::{Chart, DependencyDecl, Metadata};
pub use errors::Error;
pub use imageset::ImageSet;
pub use list::{list, ChartImages, ListOptions};

#[cfg(test)]
mod tests;
