use std::io::Write;
use std::process::{Command, Stdio};

// Make sure kind binary is in here
const KIND_BIN: &str = "../../../bin/kind";
const KUBECTL_BIN: &str = "../../../bin/kubectl";
const KIND_CLUSTER_NAME: &str = "portd-integration";
const KIND_CLUSTER_IMAGE: &str = "kindest/node";
const KIND_CLUSTER_IMAGE_VERSION_ENV: &str = "KIND_NODE_VERSION";

pub fn setup_kind() {
    cleanup_kind_no_output();
    let mut binding = Command::new(KIND_BIN);
    binding.args(["create", "cluster", "--name", KIND_CLUSTER_NAME]);
    if let Ok(v) = std::env::var(KIND_CLUSTER_IMAGE_VERSION_ENV) {
        binding.args(["--image", &format!("{}:{}", KIND_CLUSTER_IMAGE, v)]);
    };

    let out = binding.output().expect("failed to create kind cluster");
    output_result(out);

    install_crd();

    std::thread::sleep(std::time::Duration::from_secs(2));
}

pub fn cleanup_kind() {
    let out = Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output()
        .expect("failed to delete kind cluster");
    output_result(out);

    std::thread::sleep(std::time::Duration::from_secs(5));
}

pub fn cleanup_kind_no_output() {
    let _ = Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output();
}

fn install_crd() {
    let crds = portd_kubernetes::crd::generate().expect("failed to generate crd");
    let mut child = Command::new(KUBECTL_BIN)
        .args(["apply", "-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run kubectl");
    child
        .stdin
        .take()
        .expect("no stdin")
        .write_all(crds.as_bytes())
        .expect("failed to write crd");
    let out = child.wait_with_output().expect("failed to install crd");
    output_result(out);
}

fn output_result(out: std::process::Output) {
    if out.status.success() {
        println!("STDOUT");
        println!("{}", String::from_utf8_lossy(&out.stdout));
    } else {
        println!("STDERR: exit status is {}", out.status);
        println!("{}", String::from_utf8_lossy(&out.stderr));
    }
}
