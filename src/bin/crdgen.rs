use kube::CustomResourceExt;
use openldap_k8s::crd::OpenldapCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&OpenldapCluster::crd())?);
    Ok(())
}
