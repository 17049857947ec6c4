use clap::App;
use flint::encoding::base64;
use flint::identity::IdentityKey;

fn main() {
    App::new("Identity Generator")
        .version("1.0")
        .author("Conduit Networks")
        .about("Generates a fresh long-term communicator identity.")
        .get_matches();

    let key = IdentityKey::generate();

    println!("# peer identity: {}", key.peer_identity());
    println!("private_key = \"{}\"", base64::encode(&key.seed()));
}
