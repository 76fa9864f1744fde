use std::io::Write;
use std::path::PathBuf;

use accounts::config::{AccountsConfig, Limits};
use accounts::form::{self, FormState};
use accounts::guard::{GuardDecision, evaluate_route};
use accounts::services::session::Session;
use accounts::services::{profile, register};
use accounts::store::{FileStore, Repository};
use accounts::validation::FieldError;
use accounts::{AccountError, Credentials, NewUser, ProfileUpdate, Route, User};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error("log in to access {route}")]
    LoginRequired { route: Route },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("output failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<Vec<FieldError>> for CliError {
    fn from(errors: Vec<FieldError>) -> Self {
        Self::Account(AccountError::Validation(errors))
    }
}

#[derive(Parser, Debug)]
#[command(name = "accounts", about = "Local account registry: register, log in, manage profiles")]
struct Cli {
    /// Directory holding the `users` and `user` records.
    #[arg(long, env = "ACCOUNTS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Register(RegisterArgs),
    Login(LoginArgs),
    Logout,
    Whoami,
    /// List non-admin users (login required).
    Users,
    Profile(ProfileCommand),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value = "user")]
    role: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "")]
    address: String,
    #[arg(long, default_value = "")]
    phone: String,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value = "user")]
    role: String,
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    /// Show a profile; defaults to the logged-in user.
    Show { id: Option<String> },
    /// Edit profile fields; unspecified fields keep their value.
    Update {
        id: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
}

struct CliContext {
    session: Session<FileStore>,
    limits: Limits,
}

impl CliContext {
    fn repo(&self) -> &Repository<FileStore> {
        self.session.repository()
    }

    fn require(&self, route: Route) -> Result<(), CliError> {
        match evaluate_route(self.session.state(), &route) {
            GuardDecision::Render => Ok(()),
            GuardDecision::Redirect { .. } => Err(CliError::LoginRequired { route }),
            GuardDecision::Pending => Err(CliError::NotLoggedIn),
        }
    }

    fn current_user_id(&self) -> Result<String, CliError> {
        self.session.state().user().map(|u| u.id.clone()).ok_or(CliError::NotLoggedIn)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    run(cli, &mut stdout).await
}

async fn run(cli: Cli, out: &mut impl Write) -> Result<(), CliError> {
    let config = AccountsConfig::from_env();
    let data_dir = cli.data_dir.unwrap_or(config.data_dir);
    tracing::debug!(data_dir = %data_dir.display(), "opening store");

    let mut session = Session::new(Repository::new(FileStore::new(data_dir)));
    // An unreadable session record leaves the session anonymous; login and
    // logout can still replace or clear it.
    if let Err(e) = session.restore().await {
        tracing::warn!(error = %e, "stored session could not be restored");
    }
    let mut ctx = CliContext { session, limits: config.limits };

    match cli.command {
        Command::Register(args) => run_register(&ctx, args, out).await,
        Command::Login(args) => run_login(&mut ctx, args, out).await,
        Command::Logout => {
            let next = ctx.session.logout().await?;
            writeln!(out, "logged out; next: {next}")?;
            Ok(())
        }
        Command::Whoami => match ctx.session.state().user() {
            Some(user) => print_json(out, &profile_json(user)),
            None => {
                writeln!(out, "anonymous")?;
                Ok(())
            }
        },
        Command::Users => run_users(&ctx, out).await,
        Command::Profile(profile) => run_profile(&ctx, profile.command, out).await,
    }
}

async fn run_register(ctx: &CliContext, args: RegisterArgs, out: &mut impl Write) -> Result<(), CliError> {
    let mut input = FormState::register();
    input.handle_change(form::USERNAME, args.username);
    input.handle_change(form::PASSWORD, args.password);
    input.handle_change(form::ROLE_TYPE, args.role);
    input.handle_change(form::NAME, args.name);
    input.handle_change(form::ADDRESS, args.address);
    input.handle_change(form::PHONE_NUMBER, args.phone);
    let new_user = NewUser::from_form(&input)?;

    let user = register::register(ctx.repo(), &ctx.limits, new_user).await?;
    writeln!(out, "registered {} ({}) id={}", user.username, user.role_type, user.id)?;
    writeln!(out, "next: {}", Route::Login)?;
    Ok(())
}

async fn run_login(ctx: &mut CliContext, args: LoginArgs, out: &mut impl Write) -> Result<(), CliError> {
    let mut input = FormState::login();
    input.handle_change(form::USERNAME, args.username);
    input.handle_change(form::PASSWORD, args.password);
    input.handle_change(form::ROLE_TYPE, args.role);
    let credentials = Credentials::from_form(&input)?;

    let next = ctx.session.login(&credentials).await?;
    writeln!(out, "logged in as {}; next: {next}", credentials.username)?;
    Ok(())
}

async fn run_users(ctx: &CliContext, out: &mut impl Write) -> Result<(), CliError> {
    ctx.require(Route::UserList)?;
    for user in profile::list_members(ctx.repo()).await? {
        writeln!(out, "{}\t{}\t{}", user.id, user.username, user.role_type)?;
    }
    Ok(())
}

async fn run_profile(ctx: &CliContext, command: ProfileSubcommand, out: &mut impl Write) -> Result<(), CliError> {
    match command {
        ProfileSubcommand::Show { id } => {
            let id = match id {
                Some(id) => id,
                None => ctx.current_user_id()?,
            };
            ctx.require(Route::Profile(id.clone()))?;
            let user = profile::fetch_profile(ctx.repo(), &id).await?;
            print_json(out, &profile_json(&user))
        }
        ProfileSubcommand::Update { id, username, name, address, phone } => {
            let id = match id {
                Some(id) => id,
                None => ctx.current_user_id()?,
            };
            ctx.require(Route::Profile(id.clone()))?;
            let current = profile::fetch_profile(ctx.repo(), &id).await?;

            let mut input = FormState::profile(&current);
            for (field, value) in [
                (form::USERNAME, username),
                (form::NAME, name),
                (form::ADDRESS, address),
                (form::PHONE_NUMBER, phone),
            ] {
                if let Some(value) = value {
                    input.handle_change(field, value);
                }
            }
            let update = ProfileUpdate::from_form(&input)?;
            let user = profile::update_profile(ctx.repo(), &id, update).await?;
            print_json(out, &profile_json(&user))
        }
    }
}

/// Public view of a user record; the password is never printed.
fn profile_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "roleType": user.role_type.as_str(),
        "name": user.name,
        "address": user.address,
        "phoneNumber": user.phone_number,
    })
}

fn print_json(out: &mut impl Write, value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(out, "{rendered}")?;
    Ok(())
}
