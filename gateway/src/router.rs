use axum::body::Body;
use axum::http::{Request, Response};
use corral::auth::tokens::impersonation_headers;
use corral::auth::{token_from_headers, TokenManager};
use corral::dialer::DialerFactory;
use corral::models::cluster::Cluster;
use corral::store::SharedStore;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::proxy::{route_target, ProxyCache};

/// Resolves the target cluster of a request and forwards it as the caller.
#[derive(Clone)]
pub struct ClusterRouter {
    clusters: SharedStore<Cluster>,
    dialers: DialerFactory,
    proxies: ProxyCache,
    tokens: TokenManager,
}

impl ClusterRouter {
    pub fn new(clusters: SharedStore<Cluster>, dialers: DialerFactory, tokens: TokenManager) -> Self {
        Self {
            clusters,
            dialers,
            proxies: ProxyCache::new(),
            tokens,
        }
    }

    pub fn proxies(&self) -> &ProxyCache {
        &self.proxies
    }

    pub async fn serve(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (cluster_id, path) = route_target(req.uri(), req.headers()).ok_or(GatewayError::NoCluster)?;

        let cluster = match self.clusters.get_opt("", &cluster_id).await? {
            Some(cluster) => cluster,
            None => {
                self.proxies.evict(&cluster_id);
                return Err(GatewayError::NoCluster);
            }
        };

        let value = token_from_headers(req.headers())
            .ok_or_else(|| GatewayError::Unauthorized("must authenticate".to_string()))?;
        let token = self.tokens.validate(&value).await?;
        let groups = self.tokens.groups_for_token(&token).await;
        let identity = impersonation_headers(&token.user_id, &groups);

        let proxy = self.proxies.handler(&cluster)?;
        let dialer = self.dialers.cluster_dialer(&cluster_id).await?;
        let conn = dialer
            .dial("tcp", proxy.address())
            .await
            .map_err(|e| GatewayError::Upstream(cluster_id.clone(), e.to_string()))?;

        debug!(cluster = %cluster_id, user = %token.user_id, path = %path, "proxying request");
        proxy.forward(conn, req, &path, &identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use corral::dialer::TunnelServer;
    use corral::models::auth::{Token, User};
    use corral::models::cluster::{ClusterSpec, ClusterStatus};
    use corral::models::ObjectMeta;
    use corral::store::Stores;

    fn router(stores: &Stores) -> ClusterRouter {
        let tokens = TokenManager::new(
            stores.tokens.clone(),
            stores.users.clone(),
            stores.user_attributes.clone(),
        );
        let dialers = DialerFactory::new(stores.clusters.clone(), stores.nodes.clone(), TunnelServer::new());
        ClusterRouter::new(stores.clusters.clone(), dialers, tokens)
    }

    #[tokio::test]
    async fn requests_without_a_known_cluster_are_rejected() {
        let stores = Stores::memory();
        let router = router(&stores);

        let req = Request::get("/v3/settings").body(Body::empty()).unwrap();
        assert!(matches!(router.serve(req).await, Err(GatewayError::NoCluster)));

        let req = Request::get("/k8s/clusters/c-missing/api").body(Body::empty()).unwrap();
        let err = router.serve(req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_cluster_receives_caller_identity() {
        let upstream = Router::new().route(
            "/api/v1/pods",
            get(|headers: axum::http::HeaderMap| async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                };
                format!("{}|{}", header("authorization"), header("impersonate-user"))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, upstream).await.unwrap() });

        let stores = Stores::memory();
        stores
            .clusters
            .create(Cluster {
                metadata: ObjectMeta::named("local"),
                spec: ClusterSpec {
                    internal: true,
                    ..Default::default()
                },
                status: ClusterStatus {
                    api_endpoint: format!("http://{}", addr),
                    service_account_token: "sa-token".to_string(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        stores
            .users
            .create(User {
                metadata: ObjectMeta::named("u-alice"),
                ..Default::default()
            })
            .await
            .unwrap();
        stores
            .tokens
            .create(Token {
                metadata: ObjectMeta::named("token-abc"),
                token: "secretkey".to_string(),
                user_id: "u-alice".to_string(),
                auth_provider: "local".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let router = router(&stores);
        let req = Request::get("/k8s/clusters/local/api/v1/pods")
            .header("Authorization", "Bearer token-abc:secretkey")
            .body(Body::empty())
            .unwrap();
        let resp = router.serve(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = http_body_util::BodyExt::collect(resp.into_body()).await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Bearer sa-token|u-alice");
        assert_eq!(router.proxies().len(), 1);
    }
}
