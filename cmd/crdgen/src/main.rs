use guildnet_workspace::Workspace;
use kube::CustomResourceExt;

fn main() {
    for crd in [Workspace::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
