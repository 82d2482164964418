use std::io::Write;

use batch_classifier::runner::{self, RunArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());

        eprintln!("[PANIC] 程序异常退出");
        eprintln!("位置: {}", location);
        eprintln!("原因: {}", message);
        eprintln!(
            "时间: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        eprintln!("提示: 已写入的检查点会在下次运行时自动恢复");

        tracing::error!(event = "panic.raised", location = %location, reason = %message);

        let panic_msg = format!(
            "PANIC OCCURRED\nLocation: {}\nReason: {}\nTime: {}\n\n",
            location,
            message,
            chrono::Utc::now()
        );

        if let Err(e) = std::fs::write("./panic.log", &panic_msg) {
            eprintln!("[WARN] 无法写入panic.log: {}", e);
        } else {
            eprintln!("[OK] Panic信息已保存到 ./panic.log");
        }

        std::io::stderr().flush().ok();
    }));

    let mut args = std::env::args().skip(1).peekable();

    match args.peek().map(String::as_str) {
        Some("status") | Some("--status") => runner::show_status(),
        Some("check-config") | Some("--check-config") => runner::check_config(),
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("run") => {
            args.next();
            runner::start_job(RunArgs::from_args(args)).await.map(|_| ())
        }
        _ => runner::start_job(RunArgs::from_args(args)).await.map(|_| ()),
    }
}

fn print_usage() {
    println!("用法:");
    println!("  batch-classifier [run] [INPUT [OUTPUT]]   运行分类任务（可覆盖配置中的路径）");
    println!("  batch-classifier status                   查看检查点进度");
    println!("  batch-classifier check-config             校验配置与分类体系");
}
