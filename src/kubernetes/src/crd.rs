use kube::CustomResourceExt;

pub mod listener;
pub mod port_binding;
pub mod port_pool;

pub const GROUP: &str = "portd.lbport.io";

/// Every CRD as one multi-document YAML stream.
pub fn generate() -> Result<String, serde_yaml::Error> {
    let docs = [
        serde_yaml::to_string(&port_pool::PortPool::crd())?,
        serde_yaml::to_string(&port_binding::PortBinding::crd())?,
        serde_yaml::to_string(&listener::Listener::crd())?,
    ];
    Ok(docs.join("---\n"))
}
