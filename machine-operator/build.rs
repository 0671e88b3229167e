use kube::CustomResourceExt;
use nodeforge_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/machine.nodeforge.io_machinepools.yaml",
        serde_yaml::to_string(&MachinePool::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/machine.nodeforge.io_hostconfigs.yaml",
        serde_yaml::to_string(&HostConfig::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/machine.nodeforge.io_renderedhostconfigs.yaml",
        serde_yaml::to_string(&RenderedHostConfig::crd()).unwrap(),
    )
    .unwrap();
}
