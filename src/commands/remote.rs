// src/commands/remote.rs

//! Remote build commands

use super::Session;
use crate::config::BakeConfig;
use crate::progress;
use crate::remote::{self, HttpTransport, RemoteBuilder, StatusResponse};
use anyhow::{Context, Result, anyhow};
use std::io::IsTerminal;
use std::path::Path;

fn transport(config: &BakeConfig) -> Result<HttpTransport> {
    let url = config
        .remote_url
        .as_deref()
        .ok_or_else(|| anyhow!("No remote configured; run `bake remote init <url>` first"))?;
    Ok(HttpTransport::new(url)?)
}

pub fn cmd_remote_init(url: &str) -> Result<()> {
    let transport = HttpTransport::new(url)?;
    let path = BakeConfig::config_path();
    let mut config = BakeConfig::load_from(&path)?;
    config.remote_url = Some(transport.base().to_string());
    config
        .save_to(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Remote builds go to {}", transport.base());
    Ok(())
}

fn await_jobs(session: &Session, builder: &RemoteBuilder<'_>, jobs: &[String]) -> Result<()> {
    let pipeline = progress::for_terminal("remote", std::io::stderr().is_terminal());
    match builder.wait(jobs, pipeline.as_ref()) {
        Ok(statuses) => {
            for StatusResponse { job_id, arch, .. } in statuses {
                println!("{} ({}) done; fetch with `bake remote download {}`", job_id, arch, job_id);
            }
            Ok(())
        }
        Err(e) => {
            if session.cancel.is_cancelled() {
                eprintln!("Jobs keep running remotely; resume with `{}`", remote::resume_hint(jobs));
            }
            Err(e.into())
        }
    }
}

pub fn cmd_remote_build(session: &Session, archs: &[String]) -> Result<()> {
    let transport = transport(&session.config)?;
    let (path, recipe, target) = session.load()?;
    let project_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let recipe_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Invalid recipe path {}", path.display()))?;
    let archs = if archs.is_empty() {
        vec![target.arch.clone()]
    } else {
        archs.to_vec()
    };

    let builder = RemoteBuilder::new(&transport).with_cancel(session.cancel.clone());
    let jobs = builder
        .submit(project_dir, &recipe_name, &target.platform, &archs)
        .with_context(|| format!("Failed to dispatch {}", recipe.project.name))?;
    let ids: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
    for job in &jobs {
        println!("Job {} building {} for {}", job.job_id, recipe.project.name, job.arch);
    }
    await_jobs(session, &builder, &ids)
}

pub fn cmd_remote_resume(session: &Session, jobs: &[String]) -> Result<()> {
    let transport = transport(&session.config)?;
    let builder = RemoteBuilder::new(&transport).with_cancel(session.cancel.clone());
    await_jobs(session, &builder, jobs)
}

pub fn cmd_remote_download(session: &Session, job: &str, output: Option<&Path>) -> Result<()> {
    let transport = transport(&session.config)?;
    let builder = RemoteBuilder::new(&transport).with_cancel(session.cancel.clone());
    let out_dir = output.unwrap_or_else(|| Path::new("."));
    let paths = builder
        .download(job, out_dir)
        .with_context(|| format!("Failed to download artifacts of job {}", job))?;
    for path in &paths {
        println!("Downloaded {}", path.display());
    }
    Ok(())
}

pub fn cmd_remote_list(session: &Session) -> Result<()> {
    let transport = transport(&session.config)?;
    let agents = remote::RemoteTransport::list_agents(&transport)?;
    if agents.is_empty() {
        println!("No build agents");
        return Ok(());
    }
    println!("{:<24} {:<8} {:>6}  ARCHITECTURES", "NAME", "STATUS", "JOBS");
    for agent in agents {
        let archs: Vec<&str> = agent.architectures.iter().map(|a| a.as_arch()).collect();
        println!(
            "{:<24} {:<8} {:>6}  {}",
            agent.name,
            if agent.online { "online" } else { "offline" },
            agent.active_jobs,
            archs.join(",")
        );
    }
    Ok(())
}

pub fn cmd_remote_info(session: &Session, name: &str) -> Result<()> {
    let transport = transport(&session.config)?;
    let agent = remote::RemoteTransport::agent_info(&transport, name)
        .with_context(|| format!("Failed to query agent {}", name))?;
    println!("Name:          {}", agent.name);
    println!("Status:        {}", if agent.online { "online" } else { "offline" });
    if let Some(version) = &agent.version {
        println!("Version:       {}", version);
    }
    println!("Active jobs:   {}", agent.active_jobs);
    let archs: Vec<&str> = agent.architectures.iter().map(|a| a.as_arch()).collect();
    println!("Architectures: {}", archs.join(", "));
    Ok(())
}
