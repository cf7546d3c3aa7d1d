use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PersonArgs {
    /// Register a new person
    Add {
        /// Canonical name
        name: String,

        /// Name shown in output
        #[clap(short, long)]
        display_name: Option<String>,

        /// Alternate names matched during lookup ("mom, mum")
        #[clap(short, long)]
        aliases: Option<String>,
    },
    /// List every person
    List {},
    /// Look up people by name
    Search {
        /// Partial or full name
        query: String,
    },
    /// Photos a person appears in
    Photos {
        /// Person id
        id: u64,

        /// Only photos taken in this year
        #[clap(short, long)]
        year: Option<i32>,

        /// Only photos taken in this month (1-12)
        #[clap(short, long)]
        month: Option<u32>,

        /// Cap the number of photos printed
        #[clap(short, long)]
        limit: Option<usize>,
    },
    /// Name completions for a prefix
    Suggest {
        /// Name prefix
        prefix: String,

        /// Cap the number of suggestions printed
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },
    /// People ranked by photo count
    Popular {
        /// Cap the number of people printed
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum FacesArgs {
    /// Group unassigned faces into clusters
    Cluster {},
    /// Match unassigned faces against known people
    Automatch {},
    /// Attach a face to a person
    Assign { face_id: u64, person_id: u64 },
    /// Detach a face from its person
    Unmatch { face_id: u64 },
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueArgs {
    /// Drain the embedding queue
    Run {},
    /// Print queue counters
    Stats {},
    /// Requeue photos missing an embedding
    Recover {},
    /// Put terminally failed tasks back in the queue
    RetryFailed {},
}

#[derive(Subcommand, Debug, Clone)]
pub enum IndexArgs {
    /// Retrain the vector index clusters
    Rebuild {},
    /// Print index shape
    Stats {},
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add photos to the library
    Add {
        /// Image files to add
        #[clap(required = true)]
        paths: Vec<String>,

        /// Photo title
        #[clap(short, long)]
        title: Option<String>,

        /// Photo description
        #[clap(short, long)]
        description: Option<String>,

        /// Photo tags
        #[clap(short = 'g', long)]
        tags: Option<String>,

        /// Capture time, RFC 3339. File modification time when omitted.
        #[clap(long)]
        taken_at: Option<String>,
    },
    /// List photos
    List {
        /// Cap the number of photos printed
        #[clap(short, long)]
        limit: Option<usize>,
    },
    /// Delete a photo
    Rm {
        /// Photo id
        id: u64,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Search photos
    Search {
        /// Free-form query
        query: String,

        /// Cap the number of results
        #[clap(short, long)]
        limit: Option<usize>,

        /// Rank by reciprocal rank fusion instead of weighted scores
        #[clap(long, default_value = "false")]
        rrf: bool,

        /// Drop results scoring below this
        #[clap(long)]
        min_score: Option<f32>,
    },
    /// Photos similar to an already indexed photo
    Similar {
        /// Photo id
        id: u64,

        /// Number of neighbours
        #[clap(short, long, default_value = "10")]
        top: usize,
    },
    /// Show how a query is interpreted
    Intent {
        /// Free-form query
        query: String,
    },
    /// Manage people
    Person {
        #[clap(subcommand)]
        action: PersonArgs,
    },
    /// Manage detected faces
    Faces {
        #[clap(subcommand)]
        action: FacesArgs,
    },
    /// Manage the embedding queue
    Queue {
        #[clap(subcommand)]
        action: QueueArgs,
    },
    /// Manage the vector index
    Index {
        #[clap(subcommand)]
        action: IndexArgs,
    },
}
