use kube::CustomResourceExt;
use prefixd_kubernetes::crd;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&crd::prefix::Prefix::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::prefix::ClusterPrefix::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::prefix_allocation::PrefixAllocation::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::prefix_allocation::ClusterPrefixAllocation::crd()).unwrap()
    );
    println!("---");
    print!("{}", serde_yaml::to_string(&crd::ip::IP::crd()).unwrap());
}
