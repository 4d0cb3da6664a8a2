use std::sync::Arc;

use convomesh::auth::{JwtVerifier, StaticDirectory};
use convomesh::coordinator::NoopArtifactStore;
use convomesh::server::SignalServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let bind = std::env::var("CONVOMESH_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_owned());
    let secret = std::env::var("JWT_SECRET")
        .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;

    // Accounts come from the environment until the HTTP auth service is
    // wired in: "id:email" pairs, comma separated.
    let mut directory = StaticDirectory::default();
    if let Ok(users) = std::env::var("CONVOMESH_USERS") {
        for entry in users.split(',').filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some((id, email)) => directory = directory.with_user(id.trim(), email.trim()),
                None => anyhow::bail!("CONVOMESH_USERS entry without ':': {entry}"),
            }
        }
    }

    let verifier = Arc::new(JwtVerifier::new(&secret, Arc::new(directory)));
    let server = SignalServer::new(verifier, Arc::new(NoopArtifactStore));
    server.run(&bind).await?;
    Ok(())
}
