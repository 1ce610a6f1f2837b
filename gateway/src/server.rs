// src/server.rs
use corral::dialer::TunnelServer;
use corral::models::cluster::ClusterRegistrationToken;
use corral::store::SharedStore;

use crate::router::ClusterRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: ClusterRouter,
    pub tunnels: TunnelServer,
    pub registration_tokens: SharedStore<ClusterRegistrationToken>,
}
