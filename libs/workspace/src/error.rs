use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] guildnet_k8s_util::error::Error),
    #[error("kubernetes api error: {0}")]
    KubeApi(#[from] kube::Error),
    #[error("workspace {0:?} has no namespace")]
    MissingNamespace(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
