#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server binary for the chatgraph multi-agent chat service.

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    chatgraph_server::run_server().await
}
