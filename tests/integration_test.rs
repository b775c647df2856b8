mod common;
mod documents;
mod sessions;
mod wire;
