use kube::CustomResourceExt as _;
use xdb::api::v1alpha1::{DormantDatabase, Snapshot, Xdb};

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Xdb::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&DormantDatabase::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Snapshot::crd())?);
    Ok(())
}
