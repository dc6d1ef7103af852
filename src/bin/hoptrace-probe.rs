use clap::Parser;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;

use hoptrace::instrument::headers::{
    REQUEST_RECEIVED_TIME, REQUEST_SENT_TIME, RESPONSE_PROCESSING_TIME, RESPONSE_RECEIVED_TIME,
    RESPONSE_SENT_TIME, RESPONSE_TRANSMISSION_TIME, TRACE_ID,
};

#[derive(Parser)]
#[command(name = "hoptrace-probe")]
#[command(about = "Send one request and print the trace and timing headers of the reply", long_about = None)]
struct Cli {
    /// Target URL.
    #[arg(default_value = "http://localhost:8080/")]
    url: String,

    /// HTTP method.
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,

    /// Correlation id to send as `Trace-Id`.
    #[arg(short, long)]
    trace_id: Option<String>,

    /// `X-Forwarded-Host` to send, for services behind the edge guard.
    #[arg(long)]
    forwarded_host: Option<String>,

    /// Request body.
    #[arg(short, long)]
    data: Option<String>,

    /// Also print the response body.
    #[arg(short, long)]
    body: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(trace_id) = &cli.trace_id {
        headers.insert(TRACE_ID, HeaderValue::from_str(trace_id)?);
    }
    if let Some(host) = &cli.forwarded_host {
        headers.insert("x-forwarded-host", HeaderValue::from_str(host)?);
    }

    let mut request = client.request(cli.method, &cli.url).headers(headers);
    if let Some(data) = cli.data {
        request = request.body(data);
    }
    let res = request.send().await?;

    println!("Status: {}", res.status());
    for name in [
        TRACE_ID,
        REQUEST_RECEIVED_TIME,
        REQUEST_SENT_TIME,
        RESPONSE_RECEIVED_TIME,
        RESPONSE_TRANSMISSION_TIME,
        RESPONSE_PROCESSING_TIME,
        RESPONSE_SENT_TIME,
    ] {
        let value = res
            .headers()
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        println!("{:<34} {}", name.as_str(), value);
    }

    if cli.body {
        println!();
        println!("{}", res.text().await?);
    }
    Ok(())
}
