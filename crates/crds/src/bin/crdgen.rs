//! Prints the VaultUnseal CustomResourceDefinition as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crd.yaml`

use crds::VaultUnseal;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&VaultUnseal::crd())?);
    Ok(())
}
