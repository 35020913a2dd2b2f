//! Print the Stack CRD with every served version; `v1alpha3` is stored.

use anyhow::Context;
use kube::core::crd::merge_crds;
use kube::CustomResourceExt;
use stack_controller::crd::{v1beta2, Stack, STORAGE_VERSION};

fn main() -> anyhow::Result<()> {
    let crd = merge_crds(vec![Stack::crd(), v1beta2::Stack::crd()], STORAGE_VERSION)
        .context("merging Stack CRD versions")?;
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
