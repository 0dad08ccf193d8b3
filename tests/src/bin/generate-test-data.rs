use chrono::{Duration, TimeZone};
use rand::{seq::SliceRandom, Rng};
use threadsync_api::{CommentId, CommentRow, PostId, Profile, Time, UserId};
use threadsync_mock_server::Fixture;
use uuid::Uuid;

const NUM_USERS: usize = 5;

const NUM_TOP_LEVEL: usize = 25;
const MAX_REPLIES: usize = 3;
const MAX_DEPTH: usize = 3;

const COMMENT_MAX_WORDS: usize = 40;

fn gen_comment_text(rng: &mut impl Rng) -> String {
    lipsum::lipsum_words(rng.gen_range(1..=COMMENT_MAX_WORDS))
}

struct Gen<'a, R> {
    rng: R,
    post: PostId,
    users: &'a [UserId],
    clock: Time,
    rows: Vec<CommentRow>,
}

impl<'a, R: Rng> Gen<'a, R> {
    fn comment(&mut self, parent: Option<CommentId>) -> CommentId {
        self.clock = self.clock + Duration::minutes(self.rng.gen_range(1..120));
        let id = CommentId(Uuid::new_v4());
        let author = match self.users.choose(&mut self.rng) {
            Some(u) => *u,
            None => UserId::stub(),
        };
        self.rows.push(CommentRow {
            id,
            post_id: self.post,
            author_id: author,
            parent_id: parent,
            content: gen_comment_text(&mut self.rng),
            created_at: self.clock,
            updated_at: self.clock,
        });
        id
    }

    // replies are generated right after their parent, so they are always more recent
    fn thread(&mut self, parent: Option<CommentId>, depth: usize) {
        let id = self.comment(parent);
        if depth >= MAX_DEPTH {
            return;
        }
        for _ in 0..self.rng.gen_range(0..=MAX_REPLIES) {
            self.thread(Some(id), depth + 1);
        }
    }
}

fn main() -> Result<(), serde_json::Error> {
    let mut rng = rand::thread_rng();

    // Generate users
    let profiles = (0..NUM_USERS)
        .map(|_| Profile {
            id: UserId(Uuid::new_v4()),
            display_name: lipsum::lipsum_words(1).to_lowercase(),
        })
        .collect::<Vec<_>>();
    let users = profiles.iter().map(|p| p.id).collect::<Vec<_>>();

    // Generate the comment forest
    let start = chrono::Utc
        .timestamp_opt(1_600_000_000 + rng.gen_range(0..10_000_000), 0)
        .single()
        .unwrap_or_else(chrono::Utc::now);
    let mut gen = Gen {
        rng,
        post: PostId(Uuid::new_v4()),
        users: &users,
        clock: start,
        rows: Vec::new(),
    };
    for _ in 0..NUM_TOP_LEVEL {
        gen.thread(None, 0);
    }

    let fixture = Fixture {
        post: gen.post,
        profiles,
        comments: gen.rows,
    };
    println!("{}", serde_json::to_string_pretty(&fixture)?);
    eprintln!(
        "Generated {} comments by {NUM_USERS} users, use the first user with THREADSYNC_VIEWER={}",
        fixture.comments.len(),
        users[0].0
    );
    Ok(())
}
