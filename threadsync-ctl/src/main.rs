use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use threadsync_client::{
    api::{CommentId, UserId, Uuid},
    Comment, RemoteDeleteCounting, SyncConfig, ThreadProvider, ThreadView,
};
use threadsync_mock_server::{Fixture, MockServer};

#[derive(structopt::StructOpt)]
struct Opt {
    /// JSON fixture to load in the in-memory backend, as output by generate-test-data
    #[structopt(short, long)]
    fixture: PathBuf,

    /// Acting user, defaults to the THREADSYNC_VIEWER environment variable
    #[structopt(short, long)]
    viewer: Option<Uuid>,

    /// JSON file with the sync configuration, overridden by the flags below
    #[structopt(short, long)]
    config: Option<PathBuf>,

    #[structopt(long)]
    page_size: Option<usize>,

    /// Report remote deletions with the size of the removed subtree
    #[structopt(long)]
    count_remote_subtrees: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Print the thread
    Show {
        /// Number of pages of top-level comments to load
        #[structopt(short, long, default_value = "1")]
        pages: usize,
    },

    /// Post a comment
    Reply {
        content: String,

        /// Comment to reply to, top-level if not set
        #[structopt(long)]
        to: Option<Uuid>,
    },

    /// Delete one of the viewer's comments, along with all its replies
    Delete { id: Uuid },
}

fn viewer(opt: &Opt) -> anyhow::Result<Option<UserId>> {
    if let Some(v) = opt.viewer {
        return Ok(Some(UserId(v)));
    }
    match std::env::var("THREADSYNC_VIEWER") {
        Ok(v) => {
            let v = Uuid::try_parse(&v).context("parsing THREADSYNC_VIEWER as a user id")?;
            Ok(Some(UserId(v)))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).context("retrieving THREADSYNC_VIEWER environment variable"),
    }
}

fn config(opt: &Opt) -> anyhow::Result<SyncConfig> {
    let mut config = match &opt.config {
        None => SyncConfig::default(),
        Some(path) => {
            let file = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path:?}"))?;
            serde_json::from_str(&file).with_context(|| format!("parsing config file {path:?}"))?
        }
    };
    if let Some(size) = opt.page_size {
        config.page_size = size;
    }
    if opt.count_remote_subtrees {
        config.remote_delete_counting = RemoteDeleteCounting::Subtree;
    }
    Ok(config)
}

fn load_fixture(path: &PathBuf) -> anyhow::Result<Fixture> {
    let file =
        std::fs::read_to_string(path).with_context(|| format!("reading fixture {path:?}"))?;
    serde_json::from_str(&file).with_context(|| format!("parsing fixture {path:?}"))
}

/// Waits until all the requests started by the view got their answer
async fn settle<B: 'static + threadsync_client::api::Backend>(view: &mut ThreadView<B>) {
    while view.in_flight() > 0 || view.is_loading() {
        if !view.step().await {
            break;
        }
    }
}

fn print_comment(c: &Comment, depth: usize) {
    println!(
        "{:indent$}{} {} ({}, {} replies)",
        "",
        c.id.0,
        c.author.display_name,
        c.created_at.format("%Y-%m-%d %H:%M:%S"),
        c.reply_count,
        indent = 2 * depth,
    );
    for line in c.content.lines() {
        println!("{:indent$}| {line}", "", indent = 2 * depth);
    }
    for r in c.children.iter() {
        print_comment(r, depth + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opt = <Opt as structopt::StructOpt>::from_args();

    let viewer = viewer(&opt)?;
    let config = config(&opt)?;
    let fixture = load_fixture(&opt.fixture)?;
    let post = fixture.post;
    let provider = ThreadProvider::new(Arc::new(MockServer::from_fixture(fixture)), config);

    let deltas = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let d = deltas.clone();
    let mut view = provider
        .mount(post, viewer, move |delta| d.lock().push(delta))
        .await;

    match opt.cmd {
        Command::Show { pages } => {
            for _ in 1..pages {
                if !view.load_more() {
                    break;
                }
                settle(&mut view).await;
            }
        }
        Command::Reply { content, to } => {
            view.set_input(content, to.map(CommentId));
            let temp = view.submit()?;
            tracing::info!(comment = ?temp, "comment shown before confirmation");
            settle(&mut view).await;
        }
        Command::Delete { id } => {
            let removed = view.delete(CommentId(id))?;
            tracing::info!(removed, "comments hidden before confirmation");
            settle(&mut view).await;
        }
    }

    if let Some(notice) = view.take_notice() {
        eprintln!("error: {notice}");
    }
    for c in view.comments() {
        print_comment(&c, 0);
    }
    if view.has_more() {
        println!("(more comments available)");
    }
    println!("count changes: {:?}", deltas.lock());
    let total = view
        .exact_count()
        .await
        .context("counting comments on the backend")?;
    println!("comments on the backend: {total}");

    Ok(())
}
