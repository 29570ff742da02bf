use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voiceover::config::DEFAULT_PROMPT;
use voiceover::workspace::Workspace;
use voiceover::{server, Settings, VoiceOver};

#[derive(Parser)]
#[command(name = "voiceover")]
#[command(about = "Narrate videos with a vision model and synthesized speech", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the upload form (default)
    Serve,

    /// Voice over a local video file
    Render {
        input_file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_PROMPT)]
        prompt: String,
        #[arg(short, long)]
        output: PathBuf,
    },
}

// Global so `voiceover --port 9000` and `voiceover serve --port 9000` agree.
#[derive(Args)]
struct ServeArgs {
    #[arg(long, global = true, env = "VOICEOVER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,
    #[arg(long, global = true, env = "VOICEOVER_PORT", default_value_t = 8501)]
    port: u16,
    #[arg(long, global = true, env = "VOICEOVER_MAX_UPLOAD_MB", default_value_t = 200)]
    max_upload_mb: usize,
}

impl ServeArgs {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voiceover=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let voice_over = VoiceOver::new(&cli.settings)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            server::serve(cli.serve.addr(), Arc::new(voice_over), cli.serve.max_upload_bytes()).await
        }
        Command::Render {
            input_file,
            prompt,
            output,
        } => {
            if !input_file.is_file() {
                anyhow::bail!("{} is not a file", input_file.display());
            }
            let workspace = Workspace::create(
                &cli.settings.scratch_root(),
                "mp4",
                &cli.settings.speech_format,
            )?;
            let (narration, duration_secs) = voice_over
                .render_file(&input_file, &prompt, workspace.narration(), &output)
                .await?;
            workspace.close()?;

            info!("Wrote {} ({duration_secs:.1}s)", output.display());
            println!("{narration}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["voiceover", "--api-key", "sk-test"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn serve_settings_without_subcommand_read_env() {
        std::env::set_var("VOICEOVER_PORT", "9000");
        let cli = parse(&[]);
        std::env::remove_var("VOICEOVER_PORT");

        assert!(cli.command.is_none());
        assert_eq!(cli.serve.addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cli.serve.max_upload_bytes(), 200 * 1024 * 1024);
    }

    #[test]
    fn serve_flags_work_before_and_after_subcommand() {
        assert_eq!(parse(&["--port", "9100"]).serve.port, 9100);
        assert_eq!(parse(&["serve", "--port", "9200"]).serve.port, 9200);
        assert_eq!(parse(&["--host", "0.0.0.0", "serve"]).serve.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn render_takes_prompt_and_output() {
        let cli = parse(&["render", "demo.mp4", "-p", "Narrate.", "-o", "out.mp4"]);
        match cli.command {
            Some(Command::Render { input_file, prompt, output }) => {
                assert_eq!(input_file, PathBuf::from("demo.mp4"));
                assert_eq!(prompt, "Narrate.");
                assert_eq!(output, PathBuf::from("out.mp4"));
            }
            _ => panic!("expected the render subcommand"),
        }
    }
}
