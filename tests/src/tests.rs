mod consensus;
mod coordinator;
