use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use essay_corrector::{utils, ConfigStore, Engine, ProgressEvent, RunSnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    utils::logging::init();

    // 加载配置（路径可用 CONFIG_PATH 环境变量覆盖）
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let store = Arc::new(ConfigStore::load(config_path));
    let engine = Engine::new(store);

    let mut args = std::env::args().skip(1);
    let topic = match args.next() {
        Some(topic) => topic,
        None => {
            eprintln!("用法: essay_corrector <作文题目> <图片路径>...");
            std::process::exit(2);
        }
    };
    let inputs: Vec<PathBuf> = args.map(PathBuf::from).collect();

    // 提交批次，处理在后台进行
    let receipt = engine.submit_run(&topic, &inputs)?;
    info!("运行已提交: {} (共 {} 篇)", receipt.run_id, receipt.total);

    // 轮询进度直到收到 Finished
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    'poll: loop {
        ticker.tick().await;
        for event in engine.poll_events(&receipt.run_id)? {
            match event {
                ProgressEvent::Log(line) => println!("{}", line),
                ProgressEvent::Progress(_) | ProgressEvent::UsageUpdate(_) => {}
                ProgressEvent::Finished => break 'poll,
            }
        }
    }

    let snapshot = engine.run_status(&receipt.run_id)?;
    print_final_stats(&snapshot);

    Ok(())
}

// ========== 日志辅助函数 ==========

fn print_final_stats(snapshot: &RunSnapshot) {
    let failed = snapshot.errors.len();
    let success = snapshot.completed.saturating_sub(failed);

    println!("\n{}", "=".repeat(60));
    println!("📊 批改完成统计");
    println!("{}", "=".repeat(60));
    println!("状态: {}", snapshot.status);
    println!("✅ 成功: {}/{}", success, snapshot.total);
    println!("❌ 失败: {}", failed);
    for err in &snapshot.errors {
        println!("  - [作文 {}] {}", err.index + 1, err.message);
    }
    println!(
        "Token 用量: VLM {}/{} · LLM {}/{}",
        snapshot.aggregate.vlm_input,
        snapshot.aggregate.vlm_output,
        snapshot.aggregate.llm_input,
        snapshot.aggregate.llm_output
    );
    println!("报告目录: {}", snapshot.run_path);
    println!("{}", "=".repeat(60));
}
