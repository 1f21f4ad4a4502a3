use veth_cni::commands::run_cni;

fn main() {
    if let Err(err) = run_cni() {
        // Output error in CNI format
        println!("{}", err.to_json());
        std::process::exit(1);
    }
}
