use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client};

use node_mechanic::config::NodePolicy;

pub async fn run(config: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Running node-mechanic connectivity checks...\n");

    let policy = NodePolicy::load(config.as_deref())?;

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {e}");
        }
    };

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {e}");
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    print!("  Get owned node {:?} ... ", policy.node_name);
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.get(&policy.node_name).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  List pods on owned node ...... ");
    let pods: Api<Pod> = Api::all(client.clone());
    let field_selector = format!("spec.nodeName={}", policy.node_name);
    match pods.list(&ListParams::default().fields(&field_selector).limit(1)).await {
        Ok(list) => println!("OK ({} pods visible)", list.items.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Metadata service reachable ... ");
    let metadata_client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(2))
        .build()?;
    match metadata_client
        .get("http://169.254.169.254/metadata/scheduledevents?api-version=2020-07-01")
        .header("Metadata", "true")
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => println!("OK"),
        Ok(resp) => println!("FAIL (status {})", resp.status()),
        Err(e) => println!("FAIL ({e}) -- expected outside the target platform"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
