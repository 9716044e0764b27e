use native_stack::*;
use std::thread;

fn strlen(region: Region) -> usize {
  unsafe { region.as_slice() }.iter().position(|&b| b == 0).unwrap_or(region.len())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

  {
    let frame = push_stack()?;
    let s = frame.allocate_utf8("native stack")?;
    println!("strlen: {}", strlen(s));
  }

  let handles: Vec<_> = (0..4).map(|i| thread::spawn(move || {
    run_lightweight(|| -> Result<usize> {
      let frame = push_stack()?;
      let buf = frame.allocate(64, 16)?;
      unsafe { buf.as_mut_slice() }.fill(i);
      Ok(buf.addr())
    })
  })).collect();
  for h in handles {
    let addr = h.join().expect("worker panicked")?;
    println!("worker buffer at {:x}", addr);
  }
  println!("idle pooled stacks: {}", StackPool::global().idle());
  Ok(())
}
