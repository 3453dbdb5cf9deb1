//! A script used to render the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to regenerate the CRD manifest, which
//! can then be applied to the cluster ahead of deploying the operator:
//!
//! ```sh
//! cargo run -p arbiter-core --example crd > queue-crd.yaml
//! ```

use anyhow::{Context, Result};
use arbiter_core::crd::Queue;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let queue = Queue::crd();
    let queue_yaml = serde_yaml::to_string(&queue).context("error serializing Queue CRD to yaml")?;
    println!("{}", queue_yaml);
    Ok(())
}
