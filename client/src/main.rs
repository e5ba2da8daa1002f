use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use hivepost_client::{
    cache::{QueryData, QueryState},
    ClientConfig, CommentNode, Hivepost, HttpGateway, ImageFile, PostDraft, VoteAction,
};
use hivepost_shared::{CommentId, CommunityId, Post, PostId, Tally, VoteValue};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Command-line client for hivepost")]
struct Args {
    /// Overrides HIVEPOST_API_URL.
    #[arg(long, env = "HIVEPOST_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the URL that starts GitHub sign-in.
    LoginUrl {
        #[arg(long, default_value = "http://localhost:5173/")]
        redirect: String,
    },
    /// Adopt the token handed back by the sign-in redirect.
    Login { token: String },
    Logout,
    Whoami,
    Posts {
        #[arg(long)]
        community: Option<CommunityId>,
    },
    /// Show one post with its tally and comment threads.
    Post { id: PostId },
    CreatePost {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        community: Option<CommunityId>,
    },
    Communities,
    CreateCommunity {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Vote { id: PostId, direction: Direction },
    Comment {
        post: PostId,
        content: String,
        #[arg(long)]
        reply_to: Option<CommentId>,
    },
    /// Follow a post's tally until interrupted.
    WatchVotes { id: PostId },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Up,
    Down,
}

impl From<Direction> for VoteValue {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Up => VoteValue::Up,
            Direction::Down => VoteValue::Down,
        }
    }
}

fn print_post(post: &Post) {
    let community = post.community_name.as_deref().unwrap_or("-");
    println!(
        "#{:<5} {}  [{}]  likes {}  comments {}  {}",
        post.id, post.title, community, post.like_count, post.comment_count, post.created_at
    );
}

fn print_tally(post_id: PostId, tally: &Tally) {
    let mine = tally
        .user_vote
        .map(|v| format!(" (you: {v})"))
        .unwrap_or_default();
    println!(
        "post {post_id}: {} likes, {} dislikes{mine}",
        tally.likes, tally.dislikes
    );
}

fn print_thread(node: &CommentNode, depth: usize) {
    println!(
        "{:indent$}{} ({}): {}",
        "",
        node.comment.author,
        node.comment.created_at,
        node.comment.content,
        indent = depth * 2
    );
    for reply in &node.replies {
        print_thread(reply, depth + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::load()?;
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }

    let gateway = Arc::new(HttpGateway::new(&config)?);
    let app = Hivepost::start(gateway, &config)
        .await
        .with_context(|| format!("failed to reach {}", config.api_url))?;
    info!(api = %config.api_url, signed_in = app.auth.is_signed_in(), "client ready");

    match args.command {
        Command::LoginUrl { redirect } => println!("{}", app.auth.sign_in_url(&redirect)),
        Command::Login { token } => {
            let user = app.auth.sign_in(&token).await?;
            println!("signed in as {}", user.username);
        }
        Command::Logout => {
            app.auth.sign_out().await?;
            println!("signed out");
        }
        Command::Whoami => match app.auth.current_user() {
            Some(user) => println!("{} ({})", user.username, user.id),
            None => println!("not signed in"),
        },
        Command::Posts { community } => {
            let posts = match community {
                Some(id) => app.posts.by_community(id).await?,
                None => app.posts.list().await?,
            };
            posts.iter().for_each(print_post);
        }
        Command::Post { id } => {
            let post = app.posts.get(id).await?;
            print_post(&post);
            println!("{}\n{}", post.image_url, post.content);
            print_tally(id, &app.votes.tally(id).await?);
            for node in app.comments.tree(id).await? {
                print_thread(&node, 1);
            }
        }
        Command::CreatePost {
            title,
            content,
            image,
            community,
        } => {
            let image = ImageFile::read(&image).await?;
            let draft = PostDraft {
                title,
                content,
                community_id: community,
            };
            let post = app.posts.create(draft, image).await?;
            println!("created post {}", post.id);
        }
        Command::Communities => {
            for community in app.communities.list().await? {
                println!("#{:<5} {}  {}", community.id, community.name, community.description);
            }
        }
        Command::CreateCommunity { name, description } => {
            let community = app.communities.create(&name, &description).await?;
            println!("created community {} ({})", community.name, community.id);
        }
        Command::Vote { id, direction } => {
            let action = app.votes.cast(id, direction.into()).await?;
            let verb = match action {
                VoteAction::Insert { .. } => "voted",
                VoteAction::Update { .. } => "changed vote",
                VoteAction::Delete { .. } => "removed vote",
            };
            println!("{verb} on post {id}");
            print_tally(id, &app.votes.tally(id).await?);
        }
        Command::Comment {
            post,
            content,
            reply_to,
        } => {
            let comment = app.comments.create(post, &content, reply_to).await?;
            println!("comment {} added", comment.id);
        }
        Command::WatchVotes { id } => {
            let mut live = app.votes.watch(id);
            let user_id = app.auth.user_id();
            loop {
                tokio::select! {
                    state = live.changed() => match state {
                        Some(QueryState::Ready(data)) => {
                            if let QueryData::Votes(votes) = &*data {
                                print_tally(id, &Tally::from_votes(votes, user_id.as_deref()));
                            }
                        }
                        Some(QueryState::Failed(err)) => eprintln!("refresh failed: {err}"),
                        Some(QueryState::Loading) => {}
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    app.shutdown();
    Ok(())
}
