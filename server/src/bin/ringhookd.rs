use {
    clap::Parser,
    log::error,
    ringhook_server::server::{HookServer, ServerConfig},
    signal_hook::consts::SIGINT,
    socket2::{Domain, Protocol, Socket, Type},
    std::{
        io,
        net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener},
        process::ExitCode,
        sync::{atomic::AtomicBool, Arc},
    },
};

const DEFAULT_PORT: u16 = 8000;
const LISTEN_BACKLOG: i32 = 128;

#[derive(Parser)]
#[command(name = "ringhookd", about = "io_uring HTTP/1.0 hook server", version)]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> ExitCode {
    env_logger::init();
    match try_main(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let listener = bind_listener(cli.port)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;

    let server = HookServer::new(listener, ServerConfig::default())?;
    server.run(&shutdown)?;
    Ok(())
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
