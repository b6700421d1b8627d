use kube::CustomResourceExt;
use portd_kubernetes::crd;

fn main() -> anyhow::Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(&crd::port_pool::PortPool::crd())?
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::port_binding::PortBinding::crd())?
    );
    println!("---");
    print!("{}", serde_yaml::to_string(&crd::listener::Listener::crd())?);
    Ok(())
}
