use std::collections::BTreeMap;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use ocicore::name::Reference;
use ocidist::authn::{AuthMap, Credential};
use ocidist::{Client, ClientConfig};

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

type StoredAuth = BTreeMap<String, AuthEntry>;

fn load_stored_auth(p: impl AsRef<Path>) -> AuthMap {
    let stored: StoredAuth = serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap();
    stored
        .into_iter()
        .map(|(k, v)| (k, Credential::UserPass(v.username, v.password)))
        .collect()
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    image_ref: String,

    /// List the repository's tags instead of pulling.
    #[arg(long)]
    tags: bool,

    /// Print the image configuration too.
    #[arg(long)]
    config: bool,

    /// Write the first layer to this file.
    #[arg(long)]
    outfile: Option<String>,

    /// Delete the manifest instead of pulling.
    #[arg(long)]
    delete: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let image_ref: Reference = args.image_ref.parse().unwrap();

    let auth = if let Some(v) =
        std::env::vars().find_map(|(k, v)| if k == "OCIDIST_AUTH" { Some(v) } else { None })
    {
        load_stored_auth(v)
    } else {
        BTreeMap::new()
    };

    let cache_dir = std::env::vars()
        .find(|(k, _v)| k == "OCIDIST_CACHE")
        .map(|(_, v)| Path::new(&v).to_owned());

    let client = Client::with_config(ClientConfig {
        cache_dir,
        ..ClientConfig::default()
    })
    .unwrap();
    client.set_auth(auth);

    if args.tags {
        for tag in client.list_tags(&image_ref).await.unwrap() {
            println!("{tag}");
        }
        return;
    }

    if args.delete {
        client.delete_manifest(&image_ref).await.unwrap();
        println!("deleted {image_ref}");
        return;
    }

    let image = client
        .pull_image(&image_ref)
        .await
        .unwrap()
        .expect("manifest not found");
    println!("{} {}", image.digest, image.media_type);
    println!("{:#?}", image.manifest());

    if args.config {
        let config = client
            .get_image_configuration(&image_ref, image.config_descriptor())
            .await
            .unwrap()
            .expect("config blob not found");
        println!("{:#?}", config);
    }

    if let Some(outfile) = args.outfile {
        let descriptor = &image.layers()[0];
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&outfile).await.unwrap(),
        );
        let size = client
            .get_blob(&image_ref, descriptor, &mut writer)
            .await
            .unwrap()
            .expect("layer not found");
        writer.flush().await.unwrap();
        println!("wrote {size} bytes to {outfile}");
    }
}
