use std::{
    io::{stdout, Write},
    net::SocketAddr,
    path::PathBuf,
};

use casdepot::{
    actioncache::blob_access::BlobAccessActionCache,
    blobstore::configuration::{create_blob_access, read_configuration},
    digest::DigestKeyFormat,
    google::bytestream::{byte_stream_client::ByteStreamClient, ReadRequest},
};

use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Endpoint of a running cache, used by client subcommands.
    #[clap(long, default_value = "http://localhost:8980")]
    endpoint: String,
    /// Instance name to serve or talk to.
    #[clap(long, default_value = "")]
    instance: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the storage frontend.
    Serve {
        /// Blob storage configuration file.
        #[clap(long, default_value = "/config/blobstore.json")]
        config: PathBuf,
        /// Address to listen on.
        #[clap(long, default_value = "0.0.0.0:8980")]
        listen: SocketAddr,
        /// Chunk size for ByteStream reads.
        #[clap(long, default_value_t = 64 * 1024)]
        read_chunk_size: usize,
    },
    /// Stream one blob to stdout.
    Fetch { hash: String, size: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            read_chunk_size,
        } => serve(&cli.instance, &config, listen, read_chunk_size).await?,
        Command::Fetch { hash, size } => {
            fetch_blob(&cli.endpoint, &cli.instance, &hash, size).await?
        }
    };

    Ok(())
}

async fn serve(
    instance: &str,
    config_path: &PathBuf,
    listen: SocketAddr,
    read_chunk_size: usize,
) -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let config = read_configuration(config_path)?;
    let content_addressable_storage = create_blob_access(
        &config.content_addressable_storage,
        "cas",
        DigestKeyFormat::WithoutInstance,
    )
    .await?;
    // Action results are keyed by action digest, so the content never
    // matches the key; the AC store is keyed per instance instead.
    let action_cache_storage =
        create_blob_access(&config.action_cache, "ac", DigestKeyFormat::WithInstance).await?;
    let action_cache = BlobAccessActionCache::instantiate(action_cache_storage);

    info!("Starting server on {}", listen);
    casdepot::server::serve(
        listen,
        instance,
        content_addressable_storage,
        action_cache,
        read_chunk_size,
    )
    .await
}

async fn fetch_blob(endpoint: &str, instance: &str, hash: &str, size: i64) -> anyhow::Result<()> {
    let mut client = ByteStreamClient::connect(endpoint.to_string()).await?;
    let resource_name = if instance.is_empty() {
        format!("blobs/{}/{}", hash, size)
    } else {
        format!("{}/blobs/{}/{}", instance, hash, size)
    };
    let request = ReadRequest {
        resource_name,
        read_offset: 0,
        read_limit: 0,
    };

    let mut reader = client.read(request).await?.into_inner();
    while let Some(message) = reader.message().await? {
        stdout().write_all(&message.data)?;
    }

    Ok(())
}
