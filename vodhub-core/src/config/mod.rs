//! Configuration: document model and priority resolver.

mod model;
mod resolver;

pub use model::{
    ActiveConfig, Category, ConfigDoc, ExtValue, HeaderSpec, Parser, ParserExt, ParserType, Site,
    SiteType,
};
pub use resolver::{ConfigListener, ConfigResolver, ConfigSource};
